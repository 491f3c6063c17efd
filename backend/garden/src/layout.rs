//! Layout controller — placed plants, accessories and background for one
//! garden, with debounced persistence.
//!
//! Mutations apply to the in-memory layout immediately. Each one also nudges
//! a background persister task; the layout is written only after the
//! configured quiet period passes without another mutation, so a drag that
//! produces hundreds of moves results in a single write.
//!
//! Dropping or closing the controller flushes any pending write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::errors::Result;
use crate::records::{AccessoryInstance, GardenLayout, PlantInstance, Position, SharingInfo};
use crate::sync;

enum LayoutCommand {
    Changed,
    Flush(oneshot::Sender<()>),
}

pub struct LayoutController {
    user_id: String,
    layout: Arc<Mutex<GardenLayout>>,
    commands: mpsc::UnboundedSender<LayoutCommand>,
    saves: Arc<AtomicU64>,
    persister: Option<JoinHandle<()>>,
}

impl LayoutController {
    /// Start from the layout stored in the user's garden record.
    pub async fn load(ctx: &AppContext, user_id: &str) -> Result<Self> {
        let garden = sync::load_garden_state(&ctx.pool, user_id).await?;
        Ok(Self::new(ctx, user_id, garden.current_garden))
    }

    pub fn new(ctx: &AppContext, user_id: &str, initial: GardenLayout) -> Self {
        let layout = Arc::new(Mutex::new(initial));
        let saves = Arc::new(AtomicU64::new(0));
        let (commands, rx) = mpsc::unbounded_channel();

        let persister = tokio::spawn(run_persister(
            ctx.pool.clone(),
            user_id.to_string(),
            Arc::clone(&layout),
            Arc::clone(&saves),
            ctx.config.layout_save_debounce,
            rx,
        ));

        Self {
            user_id: user_id.to_string(),
            layout,
            commands,
            saves,
            persister: Some(persister),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Snapshot of the current layout.
    pub fn layout(&self) -> GardenLayout {
        self.layout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of layout writes completed so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────
    // Plants
    // ─────────────────────────────────────────────────────────

    /// Place a new plant in placement mode. Returns its instance id.
    pub fn add_plant(&self, plant_type: &str, position: Position) -> String {
        let id = format!("plant-{}", Uuid::new_v4());
        self.mutate(|layout| {
            let position = layout.canvas.clamp(position);
            layout.plants.push(PlantInstance {
                id: id.clone(),
                plant_type: plant_type.to_string(),
                position,
                scale: 1.0,
                is_placement_mode: true,
                placed_at: Utc::now(),
            });
            true
        });
        id
    }

    pub fn move_plant(&self, id: &str, position: Position) -> bool {
        self.mutate(|layout| {
            let position = layout.canvas.clamp(position);
            match layout.plants.iter_mut().find(|p| p.id == id) {
                Some(plant) => {
                    plant.position = position;
                    true
                }
                None => false,
            }
        })
    }

    pub fn remove_plant(&self, id: &str) -> bool {
        self.mutate(|layout| {
            let before = layout.plants.len();
            layout.plants.retain(|p| p.id != id);
            layout.plants.len() != before
        })
    }

    // ─────────────────────────────────────────────────────────
    // Accessories
    // ─────────────────────────────────────────────────────────

    pub fn add_accessory(&self, accessory_type: &str, position: Position) -> String {
        let id = format!("accessory-{}", Uuid::new_v4());
        self.mutate(|layout| {
            let position = layout.canvas.clamp(position);
            layout.accessories.push(AccessoryInstance {
                id: id.clone(),
                accessory_type: accessory_type.to_string(),
                position,
                is_placement_mode: true,
                placed_at: Utc::now(),
            });
            true
        });
        id
    }

    pub fn move_accessory(&self, id: &str, position: Position) -> bool {
        self.mutate(|layout| {
            let position = layout.canvas.clamp(position);
            match layout.accessories.iter_mut().find(|a| a.id == id) {
                Some(accessory) => {
                    accessory.position = position;
                    true
                }
                None => false,
            }
        })
    }

    pub fn remove_accessory(&self, id: &str) -> bool {
        self.mutate(|layout| {
            let before = layout.accessories.len();
            layout.accessories.retain(|a| a.id != id);
            layout.accessories.len() != before
        })
    }

    // ─────────────────────────────────────────────────────────
    // Whole-garden changes
    // ─────────────────────────────────────────────────────────

    /// Leave placement mode for the plant or accessory with `id`.
    pub fn confirm_placement(&self, id: &str) -> bool {
        self.mutate(|layout| {
            if let Some(plant) = layout
                .plants
                .iter_mut()
                .find(|p| p.id == id && p.is_placement_mode)
            {
                plant.is_placement_mode = false;
                return true;
            }
            if let Some(accessory) = layout
                .accessories
                .iter_mut()
                .find(|a| a.id == id && a.is_placement_mode)
            {
                accessory.is_placement_mode = false;
                return true;
            }
            false
        })
    }

    pub fn set_background_theme(&self, theme_id: &str) -> bool {
        self.mutate(|layout| {
            if layout.background_theme == theme_id {
                return false;
            }
            layout.background_theme = theme_id.to_string();
            true
        })
    }

    /// Remove every placed plant and accessory. The background stays.
    pub fn clear_garden(&self) -> bool {
        self.mutate(|layout| {
            if layout.plants.is_empty() && layout.accessories.is_empty() {
                return false;
            }
            layout.plants.clear();
            layout.accessories.clear();
            true
        })
    }

    /// Publish or unpublish the garden. A share code is kept across toggles.
    pub fn set_sharing(&self, is_public: bool) -> Option<String> {
        let mut code = None;
        self.mutate(|layout| {
            let changed = match layout.sharing.as_mut() {
                Some(sharing) if sharing.is_public == is_public => false,
                Some(sharing) => {
                    sharing.is_public = is_public;
                    sharing.shared_at = Utc::now();
                    true
                }
                None if !is_public => false,
                None => {
                    layout.sharing = Some(SharingInfo {
                        is_public: true,
                        share_code: hex::encode(&Uuid::new_v4().as_bytes()[..6]),
                        shared_at: Utc::now(),
                    });
                    true
                }
            };
            code = layout.sharing.as_ref().map(|s| s.share_code.clone());
            changed
        });
        code
    }

    // ─────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────

    /// Write any pending change now instead of waiting for the quiet period.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(LayoutCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Flush pending changes and stop the persister.
    pub async fn close(mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        // Closing the channel makes the persister write what is pending and exit.
        let (closed_tx, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.commands, closed_tx));
        if let Some(handle) = self.persister.take() {
            if let Err(e) = handle.await {
                warn!(user_id = %self.user_id, "Layout persister ended abnormally: {e}");
            }
        }
    }

    /// Apply `change` and schedule a write if it reports a modification.
    fn mutate(&self, change: impl FnOnce(&mut GardenLayout) -> bool) -> bool {
        let changed = {
            let mut layout = self.layout.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = change(&mut layout);
            if changed {
                layout.last_modified = Utc::now();
            }
            changed
        };
        if changed && self.commands.send(LayoutCommand::Changed).is_err() {
            warn!(user_id = %self.user_id, "Layout persister is gone; change kept in memory only");
        }
        changed
    }
}

async fn run_persister(
    pool: SqlitePool,
    user_id: String,
    layout: Arc<Mutex<GardenLayout>>,
    saves: Arc<AtomicU64>,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<LayoutCommand>,
) {
    let mut dirty = false;
    loop {
        let command = if dirty {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(command) => command,
                Err(_) => {
                    persist(&pool, &user_id, &layout, &saves).await;
                    dirty = false;
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match command {
            Some(LayoutCommand::Changed) => dirty = true,
            Some(LayoutCommand::Flush(ack)) => {
                if dirty {
                    persist(&pool, &user_id, &layout, &saves).await;
                    dirty = false;
                }
                let _ = ack.send(());
            }
            None => {
                if dirty {
                    persist(&pool, &user_id, &layout, &saves).await;
                }
                break;
            }
        }
    }
    debug!(user_id = %user_id, "Layout persister stopped");
}

async fn persist(
    pool: &SqlitePool,
    user_id: &str,
    layout: &Mutex<GardenLayout>,
    saves: &AtomicU64,
) {
    let snapshot = layout
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match sync::save_layout(pool, user_id, &snapshot).await {
        Ok(()) => {
            saves.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => warn!(user_id, "Failed to save garden layout: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::fixtures::pool_with_donor;
    use crate::records::CANVAS_MARGIN;

    const DEBOUNCE: Duration = Duration::from_millis(100);

    async fn context() -> AppContext {
        let pool = pool_with_donor("u1", 0).await;
        let config = Config {
            layout_save_debounce: DEBOUNCE,
            ..Config::default()
        };
        let ctx = AppContext::new(pool, config);
        sync::initialize_garden_state(&ctx.pool, "u1", ctx.canvas())
            .await
            .unwrap();
        ctx
    }

    async fn stored_layout(ctx: &AppContext) -> GardenLayout {
        sync::load_garden_state(&ctx.pool, "u1")
            .await
            .unwrap()
            .current_garden
    }

    #[tokio::test]
    async fn rapid_moves_coalesce_into_one_clamped_write() {
        let ctx = context().await;
        let controller = LayoutController::load(&ctx, "u1").await.unwrap();

        let id = controller.add_accessory("crown", Position::new(400.0, 200.0));
        assert!(controller.move_accessory(&id, Position::new(10.0, 10.0)));
        assert_eq!(controller.save_count(), 0);

        tokio::time::sleep(DEBOUNCE * 4).await;

        assert_eq!(controller.save_count(), 1);
        let stored = stored_layout(&ctx).await;
        assert_eq!(stored.accessories.len(), 1);
        assert_eq!(
            stored.accessories[0].position,
            Position::new(CANVAS_MARGIN, CANVAS_MARGIN)
        );
    }

    #[tokio::test]
    async fn each_change_restarts_the_quiet_period() {
        let ctx = context().await;
        let controller = LayoutController::load(&ctx, "u1").await.unwrap();
        let id = controller.add_plant("rose", Position::new(100.0, 100.0));

        for step in 0..5 {
            tokio::time::sleep(DEBOUNCE / 4).await;
            controller.move_plant(&id, Position::new(100.0 + step as f64, 100.0));
        }
        assert_eq!(controller.save_count(), 0);

        tokio::time::sleep(DEBOUNCE * 4).await;
        assert_eq!(controller.save_count(), 1);
        assert_eq!(stored_layout(&ctx).await.plants[0].position.x, 104.0);
    }

    #[tokio::test]
    async fn placement_mode_is_persisted_until_confirmed() {
        let ctx = context().await;
        let controller = LayoutController::load(&ctx, "u1").await.unwrap();

        let id = controller.add_plant("tulip", Position::new(300.0, 300.0));
        controller.flush().await;
        assert!(stored_layout(&ctx).await.plants[0].is_placement_mode);

        assert!(controller.confirm_placement(&id));
        assert!(!controller.confirm_placement(&id));
        controller.flush().await;
        assert!(!stored_layout(&ctx).await.plants[0].is_placement_mode);
        assert_eq!(controller.save_count(), 2);
    }

    #[tokio::test]
    async fn flush_without_changes_writes_nothing() {
        let ctx = context().await;
        let controller = LayoutController::load(&ctx, "u1").await.unwrap();
        controller.flush().await;
        assert!(!controller.remove_plant("missing"));
        assert!(!controller.move_accessory("missing", Position::new(1.0, 1.0)));
        controller.flush().await;
        assert_eq!(controller.save_count(), 0);
    }

    #[tokio::test]
    async fn close_flushes_pending_changes() {
        let ctx = context().await;
        let controller = LayoutController::load(&ctx, "u1").await.unwrap();
        controller.add_plant("fern", Position::new(200.0, 200.0));
        controller.set_background_theme("sunset");
        controller.close().await;

        let stored = stored_layout(&ctx).await;
        assert_eq!(stored.plants.len(), 1);
        assert_eq!(stored.background_theme, "sunset");
    }

    #[tokio::test]
    async fn drop_flushes_pending_changes() {
        let pool = pool_with_donor("u1", 0).await;
        let config = Config {
            layout_save_debounce: Duration::from_secs(3600),
            ..Config::default()
        };
        let ctx = AppContext::new(pool, config);
        sync::initialize_garden_state(&ctx.pool, "u1", ctx.canvas())
            .await
            .unwrap();
        {
            let controller = LayoutController::load(&ctx, "u1").await.unwrap();
            controller.add_accessory("lantern", Position::new(300.0, 300.0));
        }

        // The quiet period never elapses here; only the drop can write.
        tokio::time::timeout(Duration::from_secs(2), async {
            while stored_layout(&ctx).await.accessories.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pending layout was not written on drop");
    }

    #[tokio::test]
    async fn clear_and_remove() {
        let ctx = context().await;
        let controller = LayoutController::load(&ctx, "u1").await.unwrap();
        let plant = controller.add_plant("fern", Position::new(200.0, 200.0));
        controller.add_accessory("bench", Position::new(220.0, 220.0));

        assert!(controller.remove_plant(&plant));
        assert_eq!(controller.layout().plants.len(), 0);
        assert!(controller.clear_garden());
        assert!(controller.layout().accessories.is_empty());
        assert!(!controller.clear_garden());
    }

    #[tokio::test]
    async fn sharing_keeps_its_code() {
        let ctx = context().await;
        let controller = LayoutController::load(&ctx, "u1").await.unwrap();
        assert_eq!(controller.set_sharing(false), None);

        let code = controller.set_sharing(true).unwrap();
        assert_eq!(code.len(), 12);
        assert_eq!(controller.set_sharing(false), Some(code.clone()));
        assert!(!controller.layout().sharing.unwrap().is_public);
        assert_eq!(controller.set_sharing(true), Some(code));
    }

    #[tokio::test]
    async fn load_requires_initialized_garden() {
        let pool = pool_with_donor("u2", 0).await;
        let ctx = AppContext::new(pool, Config::default());
        assert!(LayoutController::load(&ctx, "u2").await.is_err());
    }
}
