//! Session/profile controller.
//!
//! Holds the logged-in identity together with a copy of the donor's balance
//! and donation total. The copy is kept current by listening to the event
//! bus: whenever any other controller publishes a new balance for this user
//! it is merged here and written through to device storage.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::{ContentClient, Project, ProjectView};
use crate::context::AppContext;
use crate::db;
use crate::device::DeviceStorage;
use crate::donation::{self, DonationReceipt, DonationRequest};
use crate::errors::{GardenError, Result};
use crate::events::{GardenEvent, WaterSource};
use crate::latch::OpKind;
use crate::password::verify_password;
use crate::records::{AdminRecord, DonorRecord};
use crate::sync;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorProfile {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub district_id: i64,
    pub donated_amount: f64,
    pub water_amount: i64,
}

impl From<&DonorRecord> for DonorProfile {
    fn from(donor: &DonorRecord) -> Self {
        Self {
            user_id: donor.user_id.clone(),
            name: donor.name.clone(),
            email: donor.email.clone(),
            district_id: donor.district_id,
            donated_amount: donor.donated_amount,
            water_amount: donor.water_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminProfile {
    pub admin_id: String,
    pub name: String,
    pub email: String,
}

impl From<&AdminRecord> for AdminProfile {
    fn from(admin: &AdminRecord) -> Self {
        Self {
            admin_id: admin.admin_id.clone(),
            name: admin.name.clone(),
            email: admin.email.clone(),
        }
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Profile {
    Donor(DonorProfile),
    Admin(AdminProfile),
}

impl Profile {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Donor(d) => &d.user_id,
            Self::Admin(a) => &a.admin_id,
        }
    }

    pub fn water_amount(&self) -> Option<i64> {
        match self {
            Self::Donor(d) => Some(d.water_amount),
            Self::Admin(_) => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin(_))
    }
}

/// Match `email` and `password` against donors first, then admins.
pub async fn authenticate(pool: &SqlitePool, email: &str, password: &str) -> Result<Profile> {
    if let Some(donor) = db::find_donor_by_email(pool, email).await? {
        if verify_password(password, &donor.password) {
            return Ok(Profile::Donor(DonorProfile::from(&donor)));
        }
    }
    if let Some(admin) = db::find_admin_by_email(pool, email).await? {
        if verify_password(password, &admin.password) {
            return Ok(Profile::Admin(AdminProfile::from(&admin)));
        }
    }
    Err(GardenError::InvalidCredentials)
}

pub struct SessionController {
    ctx: AppContext,
    device: Arc<DeviceStorage>,
    profile: Arc<RwLock<Option<Profile>>>,
    cancel: CancellationToken,
}

impl SessionController {
    /// Create the controller and start listening for profile/balance events.
    pub fn new(ctx: AppContext, device: Arc<DeviceStorage>) -> Self {
        let profile = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();
        spawn_listener(&ctx, Arc::clone(&profile), Arc::clone(&device), cancel.clone());
        Self {
            ctx,
            device,
            profile,
            cancel,
        }
    }

    /// Controller backed by the device storage file named in the config.
    pub async fn open(ctx: AppContext) -> Result<Self> {
        let device = DeviceStorage::open(&ctx.config.device_storage_path).await?;
        Ok(Self::new(ctx, Arc::new(device)))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Profile> {
        let profile = match authenticate(&self.ctx.pool, email, password).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Login failed for {email}: {e}");
                return Err(e);
            }
        };
        info!(user_id = profile.user_id(), admin = profile.is_admin(), "Logged in");
        self.replace_profile(profile.clone()).await;
        Ok(profile)
    }

    /// Pick up a profile saved by an earlier session on this device.
    pub async fn restore(&self) -> Option<Profile> {
        let saved = self.device.session().await?;
        *self.profile.write().await = Some(saved.clone());
        debug!(user_id = saved.user_id(), "Restored session from device storage");
        Some(saved)
    }

    pub async fn logout(&self) -> Result<()> {
        *self.profile.write().await = None;
        self.device.clear_session().await
    }

    pub async fn current(&self) -> Option<Profile> {
        self.profile.read().await.clone()
    }

    pub async fn water_amount(&self) -> Option<i64> {
        self.profile.read().await.as_ref().and_then(Profile::water_amount)
    }

    /// Re-read the donor record and publish it.
    pub async fn refresh(&self) -> Result<Profile> {
        let user_id = self.donor_id().await?;
        let donor = db::get_donor(&self.ctx.pool, &user_id)
            .await?
            .ok_or(GardenError::AccountNotFound(user_id))?;
        let profile = Profile::Donor(DonorProfile::from(&donor));
        self.replace_profile(profile.clone()).await;
        Ok(profile)
    }

    /// Donate as the logged-in donor and publish the new balance.
    pub async fn process_donation(
        &self,
        amount: f64,
        target_district_id: i64,
        project_id: Option<&str>,
        project_title: Option<&str>,
    ) -> Result<DonationReceipt> {
        let user_id = self.donor_id().await?;
        let _latch = self.ctx.latches.acquire(&user_id, OpKind::Donation)?;

        let request = DonationRequest {
            amount,
            target_district_id,
            project_id: project_id.map(String::from),
            project_title: project_title.map(String::from),
        };
        let receipt = donation::record_donation(
            &self.ctx.pool,
            &user_id,
            &request,
            self.ctx.config.donation_reward_rate,
        )
        .await?;

        if let Some(project_id) = project_id {
            if let Err(e) = self.device.record_project_donation(project_id, amount).await {
                warn!("Could not update local project ledger: {e}");
            }
        }

        let profile = {
            let mut guard = self.profile.write().await;
            if let Some(Profile::Donor(donor)) = guard.as_mut() {
                donor.donated_amount = receipt.donated_amount;
                donor.water_amount = receipt.water_amount;
            }
            guard.clone()
        };
        if let Some(profile) = profile {
            self.persist(&profile).await;
            self.ctx.bus.emit(GardenEvent::UserDataUpdated {
                user_id: user_id.clone(),
                user: profile,
            });
        }
        self.ctx.bus.water_drops_updated(
            &user_id,
            receipt.water_amount,
            Some(receipt.reward),
            WaterSource::Donation,
        );
        Ok(receipt)
    }

    /// Grant the reading reward for an impact story, once per story per device.
    pub async fn claim_story_reward(&self, story_id: &str) -> Result<i64> {
        let user_id = self.donor_id().await?;
        let _latch = self.ctx.latches.acquire(&user_id, OpKind::StoryReward)?;

        // Recorded before the credit; released again if the credit fails.
        if !self.device.mark_story_claimed(story_id).await? {
            return Err(GardenError::AlreadyClaimed(story_id.to_string()));
        }

        let reward = self.ctx.config.story_reward;
        let new_total = match sync::add_water_drops(&self.ctx.pool, &user_id, reward).await {
            Ok(total) => total,
            Err(e) => {
                if let Err(undo) = self.device.unmark_story_claimed(story_id).await {
                    warn!(story_id, "Could not release failed story claim: {undo}");
                }
                return Err(e);
            }
        };

        self.set_water_amount(new_total).await;
        self.ctx
            .bus
            .water_drops_updated(&user_id, new_total, Some(reward), WaterSource::StoryReward);
        info!(user_id = %user_id, story_id, reward, new_total, "Story reward claimed");
        Ok(new_total)
    }

    pub async fn story_reward_claimed(&self, story_id: &str) -> bool {
        self.device.has_claimed_story(story_id).await
    }

    /// Published projects with this device's own donations added to the
    /// raised amount.
    pub async fn projects(&self, content: &ContentClient) -> Vec<ProjectView> {
        self.project_views(content.projects().await).await
    }

    pub async fn project_views(&self, projects: Vec<Project>) -> Vec<ProjectView> {
        let mut views = Vec::with_capacity(projects.len());
        for project in projects {
            let local = self.device.project_donations(&project.id).await;
            views.push(ProjectView::new(project, local));
        }
        views
    }

    /// Stop merging bus events into this controller.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn donor_id(&self) -> Result<String> {
        match self.profile.read().await.as_ref() {
            Some(Profile::Donor(d)) => Ok(d.user_id.clone()),
            _ => Err(GardenError::NotLoggedIn),
        }
    }

    async fn replace_profile(&self, profile: Profile) {
        *self.profile.write().await = Some(profile.clone());
        self.persist(&profile).await;
        self.ctx.bus.emit(GardenEvent::UserDataUpdated {
            user_id: profile.user_id().to_string(),
            user: profile,
        });
    }

    async fn set_water_amount(&self, total: i64) {
        let profile = {
            let mut guard = self.profile.write().await;
            if let Some(Profile::Donor(donor)) = guard.as_mut() {
                donor.water_amount = total;
            }
            guard.clone()
        };
        if let Some(profile) = profile {
            self.persist(&profile).await;
        }
    }

    async fn persist(&self, profile: &Profile) {
        if let Err(e) = self.device.save_session(profile).await {
            warn!("Could not save session to device storage: {e}");
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_listener(
    ctx: &AppContext,
    profile: Arc<RwLock<Option<Profile>>>,
    device: Arc<DeviceStorage>,
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
                        warn!("Session listener skipped {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if let Some(updated) = merge_event(&profile, event).await {
                if let Err(e) = device.save_session(&updated).await {
                    warn!("Could not save session to device storage: {e}");
                }
            }
        }
        debug!("Session listener stopped");
    });
}

/// Apply `event` to the held profile. Returns the profile if it changed.
async fn merge_event(profile: &RwLock<Option<Profile>>, event: GardenEvent) -> Option<Profile> {
    let mut guard = profile.write().await;
    let current = guard.as_mut()?;
    if current.user_id() != event.user_id() {
        return None;
    }

    match event {
        GardenEvent::WaterDropsUpdated { new_total, .. } => match current {
            Profile::Donor(donor) if donor.water_amount != new_total => {
                donor.water_amount = new_total;
            }
            _ => return None,
        },
        GardenEvent::UserDataUpdated { user, .. } => {
            if *current == user {
                return None;
            }
            *current = user;
        }
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::fixtures::{donor, memory_pool};
    use crate::password::hash_password;
    use std::time::Duration;

    async fn context() -> AppContext {
        let pool = memory_pool().await;
        db::create_donor(&pool, &donor("u1", 100)).await.unwrap();
        db::create_admin(
            &pool,
            &AdminRecord {
                admin_id: "a1".to_string(),
                name: "Admin".to_string(),
                email: "admin@example.org".to_string(),
                password: "s3cret".to_string(),
            },
        )
        .await
        .unwrap();
        AppContext::new(pool, Config::default())
    }

    async fn logged_in() -> (AppContext, SessionController) {
        let ctx = context().await;
        let session = SessionController::new(ctx.clone(), Arc::new(DeviceStorage::in_memory()));
        session.login("u1@example.org", "hunter2").await.unwrap();
        (ctx, session)
    }

    async fn eventually_water(session: &SessionController, expected: i64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.water_amount().await != Some(expected) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("balance never propagated");
    }

    #[tokio::test]
    async fn login_matches_donor_then_admin() {
        let ctx = context().await;
        let session = SessionController::new(ctx, Arc::new(DeviceStorage::in_memory()));

        let donor = session.login("u1@example.org", "hunter2").await.unwrap();
        assert_eq!(donor.user_id(), "u1");
        assert_eq!(donor.water_amount(), Some(100));

        let admin = session.login("admin@example.org", "s3cret").await.unwrap();
        assert!(admin.is_admin());

        assert!(matches!(
            session.login("u1@example.org", "wrong").await,
            Err(GardenError::InvalidCredentials)
        ));
        assert!(matches!(
            session.login("nobody@example.org", "hunter2").await,
            Err(GardenError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn hashed_donor_password_logs_in() {
        let ctx = context().await;
        let mut hashed = donor("u2", 0);
        hashed.password = hash_password("tulips").unwrap();
        db::create_donor(&ctx.pool, &hashed).await.unwrap();

        let profile = authenticate(&ctx.pool, "u2@example.org", "tulips")
            .await
            .unwrap();
        assert_eq!(profile.user_id(), "u2");
        assert!(matches!(
            authenticate(&ctx.pool, "u2@example.org", &hashed.password).await,
            Err(GardenError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn donation_rewards_five_drops_per_unit() {
        let (ctx, session) = logged_in().await;

        let receipt = session
            .process_donation(25.0, 2, Some("p-1"), Some("Wells"))
            .await
            .unwrap();
        assert_eq!(receipt.reward, 125);
        assert_eq!(session.water_amount().await, Some(225));

        match session.current().await {
            Some(Profile::Donor(d)) => assert_eq!(d.donated_amount, 25.0),
            other => panic!("unexpected profile {other:?}"),
        }

        let log = db::transactions_for_user(&ctx.pool, "u1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].target_district_id, 2);
        assert_eq!(log[0].project_title.as_deref(), Some("Wells"));
    }

    #[tokio::test]
    async fn donation_requires_a_donor() {
        let ctx = context().await;
        let session = SessionController::new(ctx, Arc::new(DeviceStorage::in_memory()));
        assert!(matches!(
            session.process_donation(5.0, 1, None, None).await,
            Err(GardenError::NotLoggedIn)
        ));

        session.login("admin@example.org", "s3cret").await.unwrap();
        assert!(matches!(
            session.process_donation(5.0, 1, None, None).await,
            Err(GardenError::NotLoggedIn)
        ));
    }

    #[tokio::test]
    async fn merges_balance_published_by_others() {
        let (ctx, session) = logged_in().await;

        ctx.bus
            .water_drops_updated("u1", 42, Some(-58), WaterSource::Purchase);
        eventually_water(&session, 42).await;

        // Events for other users are ignored.
        ctx.bus
            .water_drops_updated("u2", 7, None, WaterSource::Sync);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.water_amount().await, Some(42));
    }

    #[tokio::test]
    async fn closed_session_stops_merging() {
        let (ctx, session) = logged_in().await;
        session.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        ctx.bus.water_drops_updated("u1", 1, None, WaterSource::Sync);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.water_amount().await, Some(100));
    }

    #[tokio::test]
    async fn story_reward_is_granted_once_per_device() {
        let (ctx, session) = logged_in().await;

        let total = session.claim_story_reward("story-1").await.unwrap();
        assert_eq!(total, 100 + ctx.config.story_reward);
        assert!(matches!(
            session.claim_story_reward("story-1").await,
            Err(GardenError::AlreadyClaimed(_))
        ));
        assert_eq!(
            db::get_water_amount(&ctx.pool, "u1").await.unwrap(),
            Some(total)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_story_claims_credit_once() {
        let (ctx, session) = logged_in().await;

        let (a, b) = tokio::join!(
            session.claim_story_reward("story-1"),
            session.claim_story_reward("story-1")
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        for refused in [a, b].into_iter().filter_map(|r| r.err()) {
            assert!(matches!(
                refused,
                GardenError::AlreadyClaimed(_) | GardenError::OperationInFlight(_)
            ));
        }
        assert_eq!(
            db::get_water_amount(&ctx.pool, "u1").await.unwrap(),
            Some(100 + ctx.config.story_reward)
        );
        assert!(session.story_reward_claimed("story-1").await);
    }

    #[tokio::test]
    async fn unwritable_device_claims_nothing() {
        let ctx = context().await;
        let path = std::env::temp_dir()
            .join(format!("reach-garden-missing-{}", uuid::Uuid::new_v4()))
            .join("device.json");
        let device = Arc::new(DeviceStorage::open(&path).await.unwrap());
        let session = SessionController::new(ctx.clone(), Arc::clone(&device));

        // Device storage is not authoritative; login still succeeds.
        session.login("u1@example.org", "hunter2").await.unwrap();
        assert!(matches!(
            session.claim_story_reward("story-1").await,
            Err(GardenError::Io(_))
        ));
        assert!(!session.story_reward_claimed("story-1").await);
        assert_eq!(db::get_water_amount(&ctx.pool, "u1").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn failed_credit_releases_story_claim() {
        let (ctx, session) = logged_in().await;
        ctx.pool.close().await;

        assert!(matches!(
            session.claim_story_reward("story-1").await,
            Err(GardenError::StoreUnavailable(_))
        ));
        assert!(!session.story_reward_claimed("story-1").await);
    }

    #[tokio::test]
    async fn project_views_add_this_device_donations() {
        let (_ctx, session) = logged_in().await;
        session
            .process_donation(7.5, 2, Some("p-1"), Some("Wells"))
            .await
            .unwrap();

        let project = |id: &str| Project {
            id: id.to_string(),
            title: "Wells".to_string(),
            description: String::new(),
            district_id: Some(2),
            goal: 100.0,
            raised: 40.0,
        };
        let views = session.project_views(vec![project("p-1"), project("p-2")]).await;
        assert_eq!(views[0].displayed_raised, 47.5);
        assert_eq!(views[1].displayed_raised, 40.0);
    }

    #[tokio::test]
    async fn session_restores_from_device() {
        let ctx = context().await;
        let device = Arc::new(DeviceStorage::in_memory());
        {
            let first = SessionController::new(ctx.clone(), Arc::clone(&device));
            first.login("u1@example.org", "hunter2").await.unwrap();
        }

        let second = SessionController::new(ctx, Arc::clone(&device));
        assert_eq!(second.current().await, None);
        let restored = second.restore().await.unwrap();
        assert_eq!(restored.user_id(), "u1");

        second.logout().await.unwrap();
        assert!(device.session().await.is_none());
    }

    #[tokio::test]
    async fn session_survives_restart_through_device_file() {
        let path = std::env::temp_dir().join(format!("reach-garden-session-{}.json", uuid::Uuid::new_v4()));
        let pool = memory_pool().await;
        db::create_donor(&pool, &donor("u1", 100)).await.unwrap();
        let ctx = AppContext::new(
            pool,
            Config {
                device_storage_path: path.clone(),
                ..Config::default()
            },
        );

        {
            let session = SessionController::open(ctx.clone()).await.unwrap();
            session.login("u1@example.org", "hunter2").await.unwrap();
        }
        let reopened = SessionController::open(ctx).await.unwrap();
        assert_eq!(reopened.restore().await.map(|p| p.water_amount()), Some(Some(100)));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn refresh_picks_up_out_of_band_changes() {
        let (ctx, session) = logged_in().await;
        db::adjust_water_amount(&ctx.pool, "u1", 11).await.unwrap();

        let profile = session.refresh().await.unwrap();
        assert_eq!(profile.water_amount(), Some(111));
        assert_eq!(session.water_amount().await, Some(111));
    }
}
