//! Local device storage.
//!
//! Holds what a browser would keep in local storage: the logged-in profile,
//! the ids of impact stories whose reading reward was already claimed, and a
//! per-project ledger of this device's donations. None of it is
//! authoritative; balances always come from the record store.
//!
//! Backed by a single JSON file, rewritten on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::session::Profile;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct DeviceData {
    #[serde(default)]
    session: Option<Profile>,
    #[serde(default)]
    claimed_story_rewards: BTreeSet<String>,
    #[serde(default)]
    project_donations: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct DeviceStorage {
    path: Option<PathBuf>,
    data: Mutex<DeviceData>,
}

impl DeviceStorage {
    /// Open the storage file, starting empty if it is missing or unreadable.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding unreadable device storage {}: {e}", path.display());
                DeviceData::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DeviceData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// Storage that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(DeviceData::default()),
        }
    }

    pub async fn session(&self) -> Option<Profile> {
        self.data.lock().await.session.clone()
    }

    pub async fn save_session(&self, profile: &Profile) -> Result<()> {
        let mut data = self.data.lock().await;
        data.session = Some(profile.clone());
        self.persist(&data).await
    }

    pub async fn clear_session(&self) -> Result<()> {
        let mut data = self.data.lock().await;
        data.session = None;
        self.persist(&data).await
    }

    pub async fn has_claimed_story(&self, story_id: &str) -> bool {
        self.data.lock().await.claimed_story_rewards.contains(story_id)
    }

    /// Record a claimed story reward. Returns `false` if it was already recorded.
    pub async fn mark_story_claimed(&self, story_id: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        if !data.claimed_story_rewards.insert(story_id.to_string()) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&data).await {
            data.claimed_story_rewards.remove(story_id);
            return Err(e);
        }
        Ok(true)
    }

    /// Forget a claimed story reward whose credit did not go through.
    pub async fn unmark_story_claimed(&self, story_id: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        if data.claimed_story_rewards.remove(story_id) {
            self.persist(&data).await?;
        }
        Ok(())
    }

    /// Add to this device's running total for a project. Returns the new total.
    pub async fn record_project_donation(&self, project_id: &str, amount: f64) -> Result<f64> {
        let mut data = self.data.lock().await;
        let total = {
            let entry = data
                .project_donations
                .entry(project_id.to_string())
                .or_insert(0.0);
            *entry += amount;
            *entry
        };
        self.persist(&data).await?;
        Ok(total)
    }

    pub async fn project_donations(&self, project_id: &str) -> f64 {
        self.data
            .lock()
            .await
            .project_donations
            .get(project_id)
            .copied()
            .unwrap_or(0.0)
    }

    async fn persist(&self, data: &DeviceData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Device storage written to {}", path.display());
        Ok(())
    }
}
