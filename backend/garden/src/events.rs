//! In-process event bus shared by the session and gameplay controllers.
//!
//! Several controllers cache the same water-drop balance. Whenever one of them
//! learns of a new value it publishes an event here and the others merge it,
//! so views backed by different controllers never drift within a process.
//! Events are tagged with the user id; subscribers ignore other users.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::session::Profile;

/// Why a balance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterSource {
    /// Reward for a donation.
    Donation,
    /// Spent on a garden item.
    Purchase,
    /// Reward for a claimed challenge.
    Challenge,
    /// Reward for reading an impact story.
    StoryReward,
    /// Any other reward flow.
    Reward,
    /// Re-read from the donor record.
    Sync,
}

impl WaterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Donation => "donation",
            Self::Purchase => "purchase",
            Self::Challenge => "challenge",
            Self::StoryReward => "story_reward",
            Self::Reward => "reward",
            Self::Sync => "sync",
        }
    }
}

/// All events carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GardenEvent {
    /// The logged-in profile was replaced wholesale.
    UserDataUpdated { user_id: String, user: Profile },
    /// The spendable balance changed.
    WaterDropsUpdated {
        user_id: String,
        new_total: i64,
        amount_added: Option<i64>,
        source: Option<WaterSource>,
    },
}

impl GardenEvent {
    pub fn user_id(&self) -> &str {
        match self {
            Self::UserDataUpdated { user_id, .. } | Self::WaterDropsUpdated { user_id, .. } => {
                user_id
            }
        }
    }

    /// Short identifier used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserDataUpdated { .. } => "user_data_updated",
            Self::WaterDropsUpdated { .. } => "water_drops_updated",
        }
    }
}

/// Fan-out channel for [`GardenEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GardenEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers.
    pub fn emit(&self, event: GardenEvent) {
        trace!(kind = event.as_str(), user_id = event.user_id(), "Emitting garden event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GardenEvent> {
        self.sender.subscribe()
    }

    /// Convenience for the most common event.
    pub fn water_drops_updated(
        &self,
        user_id: &str,
        new_total: i64,
        amount_added: Option<i64>,
        source: WaterSource,
    ) {
        self.emit(GardenEvent::WaterDropsUpdated {
            user_id: user_id.to_string(),
            new_total,
            amount_added,
            source: Some(source),
        });
    }
}
