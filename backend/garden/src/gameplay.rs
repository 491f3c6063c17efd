//! Gameplay state controller.
//!
//! In-memory view of one user's garden economy: balance, owned items and
//! challenge progress. Currency and ownership changes are awaited against
//! the sync layer and applied locally only once confirmed, so the view never
//! shows an item that was not actually bought.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::errors::{GardenError, Result};
use crate::events::{GardenEvent, WaterSource};
use crate::latch::OpKind;
use crate::records::{
    to_set, ChallengeStatus, GardenStateRecord, ItemType, DEFAULT_ACCESSORIES, DEFAULT_PLANTS,
    DEFAULT_THEMES,
};
use crate::sync;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameplayState {
    pub water_drops: i64,
    pub owned_plants: BTreeSet<String>,
    pub owned_accessories: BTreeSet<String>,
    pub owned_themes: BTreeSet<String>,
    pub completed_challenges: BTreeMap<String, ChallengeStatus>,
    pub last_daily_reset_date: Option<NaiveDate>,
    pub loading: bool,
    pub initialized: bool,
}

impl Default for GameplayState {
    fn default() -> Self {
        Self {
            water_drops: 0,
            owned_plants: to_set(DEFAULT_PLANTS),
            owned_accessories: to_set(DEFAULT_ACCESSORIES),
            owned_themes: to_set(DEFAULT_THEMES),
            completed_challenges: BTreeMap::new(),
            last_daily_reset_date: None,
            loading: true,
            initialized: false,
        }
    }
}

impl GameplayState {
    fn from_record(record: &GardenStateRecord) -> Self {
        Self {
            water_drops: record.water_drops,
            owned_plants: record.owned_plants.clone(),
            owned_accessories: record.owned_accessories.clone(),
            owned_themes: record.owned_themes.clone(),
            completed_challenges: record.completed_challenges.clone(),
            last_daily_reset_date: record.last_daily_reset_date,
            loading: false,
            initialized: true,
        }
    }

    pub fn owns(&self, item_type: ItemType, item_id: &str) -> bool {
        match item_type {
            ItemType::Plant => self.owned_plants.contains(item_id),
            ItemType::Accessory => self.owned_accessories.contains(item_id),
            ItemType::Theme => self.owned_themes.contains(item_id),
        }
    }

    pub fn is_claimed(&self, challenge_id: &str) -> bool {
        self.completed_challenges
            .get(challenge_id)
            .is_some_and(|c| c.claimed)
    }

    fn owned_mut(&mut self, item_type: ItemType) -> &mut BTreeSet<String> {
        match item_type {
            ItemType::Plant => &mut self.owned_plants,
            ItemType::Accessory => &mut self.owned_accessories,
            ItemType::Theme => &mut self.owned_themes,
        }
    }
}

pub struct GameplayController {
    ctx: AppContext,
    user_id: String,
    state: Arc<RwLock<GameplayState>>,
    cancel: CancellationToken,
}

impl GameplayController {
    pub fn new(ctx: AppContext, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let state = Arc::new(RwLock::new(GameplayState::default()));
        let cancel = CancellationToken::new();
        spawn_listener(&ctx, user_id.clone(), Arc::clone(&state), cancel.clone());
        Self {
            ctx,
            user_id,
            state,
            cancel,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Load (or create) the garden record and run the daily reset if due.
    ///
    /// Store failures are logged and leave the controller on defaults with
    /// `initialized == false`.
    pub async fn start(&self) {
        self.state.write().await.loading = true;

        match self.load().await {
            Ok(record) => {
                let loaded = GameplayState::from_record(&record);
                let balance = loaded.water_drops;
                *self.state.write().await = loaded;
                info!(user_id = %self.user_id, balance, "Gameplay state initialized");
                self.ctx
                    .bus
                    .water_drops_updated(&self.user_id, balance, None, WaterSource::Sync);
            }
            Err(e) => {
                warn!(user_id = %self.user_id, "Falling back to default garden state: {e}");
                *self.state.write().await = GameplayState {
                    loading: false,
                    initialized: false,
                    ..GameplayState::default()
                };
            }
        }
    }

    async fn load(&self) -> Result<GardenStateRecord> {
        let pool = &self.ctx.pool;
        let record = sync::initialize_garden_state(pool, &self.user_id, self.ctx.canvas()).await?;

        let today = sync::today();
        if record.last_daily_reset_date == Some(today) {
            return Ok(record);
        }
        debug!(user_id = %self.user_id, "Daily challenge reset due");
        sync::reset_daily_challenges_on(pool, &self.user_id, today).await?;
        sync::load_garden_state(pool, &self.user_id).await
    }

    pub async fn state(&self) -> GameplayState {
        self.state.read().await.clone()
    }

    pub async fn water_drops(&self) -> i64 {
        self.state.read().await.water_drops
    }

    /// Buy an item. The local view changes only after the store confirms.
    pub async fn purchase_item(&self, item_id: &str, cost: i64, item_type: ItemType) -> Result<i64> {
        let _latch = self.ctx.latches.acquire(&self.user_id, OpKind::Purchase)?;

        let new_balance =
            sync::purchase(&self.ctx.pool, &self.user_id, item_id, cost, item_type).await?;

        {
            let mut state = self.state.write().await;
            state.water_drops = new_balance;
            state.owned_mut(item_type).insert(item_id.to_string());
        }
        self.ctx.bus.water_drops_updated(
            &self.user_id,
            new_balance,
            Some(-cost),
            WaterSource::Purchase,
        );
        Ok(new_balance)
    }

    /// Claim a challenge reward once per day.
    pub async fn claim_challenge(&self, challenge_id: &str, reward: i64) -> Result<i64> {
        if self.state.read().await.is_claimed(challenge_id) {
            return Err(GardenError::AlreadyClaimed(challenge_id.to_string()));
        }
        let _latch = self
            .ctx
            .latches
            .acquire(&self.user_id, OpKind::ClaimChallenge)?;

        let new_balance =
            sync::claim_challenge(&self.ctx.pool, &self.user_id, challenge_id, reward).await?;

        {
            let mut state = self.state.write().await;
            state.water_drops = new_balance;
            state.completed_challenges.insert(
                challenge_id.to_string(),
                ChallengeStatus {
                    completed: true,
                    claimed: true,
                    last_claim_date: Some(sync::today()),
                },
            );
        }
        self.ctx.bus.water_drops_updated(
            &self.user_id,
            new_balance,
            Some(reward),
            WaterSource::Challenge,
        );
        Ok(new_balance)
    }

    pub async fn add_water_drops(&self, amount: i64, source: WaterSource) -> Result<i64> {
        let _latch = self
            .ctx
            .latches
            .acquire(&self.user_id, OpKind::AddWaterDrops)?;

        let new_balance = sync::add_water_drops(&self.ctx.pool, &self.user_id, amount).await?;
        self.state.write().await.water_drops = new_balance;
        self.ctx
            .bus
            .water_drops_updated(&self.user_id, new_balance, Some(amount), source);
        Ok(new_balance)
    }

    /// Re-read the canonical balance and publish it.
    pub async fn sync_balance(&self) -> Result<i64> {
        let balance = sync::sync_balance(&self.ctx.pool, &self.user_id).await?;
        self.state.write().await.water_drops = balance;
        self.ctx
            .bus
            .water_drops_updated(&self.user_id, balance, None, WaterSource::Sync);
        Ok(balance)
    }

    pub async fn reset_daily_challenges(&self) -> Result<()> {
        let today = sync::today();
        sync::reset_daily_challenges_on(&self.ctx.pool, &self.user_id, today).await?;

        let mut state = self.state.write().await;
        state.completed_challenges.clear();
        state.last_daily_reset_date = Some(today);
        Ok(())
    }

    /// Stop merging bus events into this controller.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for GameplayController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Merge balances published by other controllers (e.g. donations).
fn spawn_listener(
    ctx: &AppContext,
    user_id: String,
    state: Arc<RwLock<GameplayState>>,
    cancel: CancellationToken,
) {
    let mut rx = ctx.bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Gameplay listener skipped {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if let GardenEvent::WaterDropsUpdated {
                user_id: ref target,
                new_total,
                ..
            } = event
            {
                if *target == user_id {
                    state.write().await.water_drops = new_total;
                }
            }
        }
        debug!(user_id = %user_id, "Gameplay listener stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::db::fixtures::pool_with_donor;
    use crate::device::DeviceStorage;
    use crate::session::SessionController;
    use std::time::Duration;

    async fn started(balance: i64) -> (AppContext, GameplayController) {
        let pool = pool_with_donor("u1", balance).await;
        let ctx = AppContext::new(pool, Config::default());
        let gameplay = GameplayController::new(ctx.clone(), "u1");
        gameplay.start().await;
        (ctx, gameplay)
    }

    #[tokio::test]
    async fn start_initializes_and_resets_daily() {
        let (ctx, gameplay) = started(70).await;
        let state = gameplay.state().await;
        assert!(state.initialized);
        assert!(!state.loading);
        assert_eq!(state.water_drops, 70);
        assert_eq!(state.last_daily_reset_date, Some(sync::today()));
        assert!(state.owns(ItemType::Plant, "sunflower"));

        let stored = db::get_garden(&ctx.pool, "u1").await.unwrap().unwrap();
        assert_eq!(stored.last_daily_reset_date, Some(sync::today()));
    }

    #[tokio::test]
    async fn start_keeps_todays_claims() {
        let (ctx, gameplay) = started(0).await;
        gameplay.claim_challenge("c1", 5).await.unwrap();

        let again = GameplayController::new(ctx.clone(), "u1");
        again.start().await;
        assert!(again.state().await.is_claimed("c1"));
    }

    #[tokio::test]
    async fn start_falls_back_when_store_is_down() {
        let pool = pool_with_donor("u1", 70).await;
        let ctx = AppContext::new(pool, Config::default());
        ctx.pool.close().await;

        let gameplay = GameplayController::new(ctx, "u1");
        gameplay.start().await;
        let state = gameplay.state().await;
        assert!(!state.initialized);
        assert!(!state.loading);
        assert_eq!(state.water_drops, 0);
        assert!(state.owns(ItemType::Theme, "meadow"));
    }

    #[tokio::test]
    async fn start_for_unknown_account_falls_back() {
        let pool = pool_with_donor("u1", 70).await;
        let ctx = AppContext::new(pool, Config::default());
        let gameplay = GameplayController::new(ctx, "ghost");
        gameplay.start().await;
        assert!(!gameplay.state().await.initialized);
    }

    #[tokio::test]
    async fn purchase_applies_only_on_success() {
        let (_ctx, gameplay) = started(100).await;

        assert_eq!(
            gameplay
                .purchase_item("theme-sunset", 40, ItemType::Theme)
                .await
                .unwrap(),
            60
        );
        let state = gameplay.state().await;
        assert!(state.owns(ItemType::Theme, "theme-sunset"));
        assert_eq!(state.water_drops, 60);

        let err = gameplay
            .purchase_item("castle", 500, ItemType::Accessory)
            .await
            .unwrap_err();
        assert!(matches!(err, GardenError::InsufficientBalance { .. }));
        let state = gameplay.state().await;
        assert!(!state.owns(ItemType::Accessory, "castle"));
        assert_eq!(state.water_drops, 60);
    }

    #[tokio::test]
    async fn store_failure_is_distinguishable_from_short_balance() {
        let (ctx, gameplay) = started(100).await;
        ctx.pool.close().await;

        let err = gameplay
            .purchase_item("rose", 10, ItemType::Plant)
            .await
            .unwrap_err();
        assert!(err.is_store_failure());
        assert!(!gameplay.state().await.owns(ItemType::Plant, "rose"));
    }

    #[tokio::test]
    async fn concurrent_purchase_is_latched() {
        let (ctx, gameplay) = started(100).await;
        let _held = ctx.latches.acquire("u1", OpKind::Purchase).unwrap();

        let err = gameplay
            .purchase_item("rose", 10, ItemType::Plant)
            .await
            .unwrap_err();
        assert!(matches!(err, GardenError::OperationInFlight("purchase")));
        assert_eq!(db::get_water_amount(&ctx.pool, "u1").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn challenge_claims_once() {
        let (_ctx, gameplay) = started(0).await;
        assert_eq!(gameplay.claim_challenge("c1", 15).await.unwrap(), 15);
        assert!(matches!(
            gameplay.claim_challenge("c1", 15).await,
            Err(GardenError::AlreadyClaimed(_))
        ));
        assert_eq!(gameplay.water_drops().await, 15);

        gameplay.reset_daily_challenges().await.unwrap();
        assert!(!gameplay.state().await.is_claimed("c1"));
        assert_eq!(gameplay.claim_challenge("c1", 15).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn purchase_refreshes_session_balance() {
        let (ctx, gameplay) = started(100).await;
        let session = SessionController::new(ctx.clone(), Arc::new(DeviceStorage::in_memory()));
        session.login("u1@example.org", "hunter2").await.unwrap();

        gameplay
            .purchase_item("rose", 25, ItemType::Plant)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while session.water_amount().await != Some(75) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never saw the purchase");
    }

    #[tokio::test]
    async fn donation_reaches_gameplay_view() {
        let (ctx, gameplay) = started(0).await;
        let session = SessionController::new(ctx.clone(), Arc::new(DeviceStorage::in_memory()));
        session.login("u1@example.org", "hunter2").await.unwrap();

        session.process_donation(4.0, 1, None, None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while gameplay.water_drops().await != 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("gameplay never saw the donation");

        // The mirror is stale until the next sync.
        assert_eq!(gameplay.sync_balance().await.unwrap(), 20);
        let garden = db::get_garden(&ctx.pool, "u1").await.unwrap().unwrap();
        assert_eq!(garden.water_drops, 20);
    }
}
