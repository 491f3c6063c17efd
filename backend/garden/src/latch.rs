//! Per-user, per-operation in-flight latches.
//!
//! A second purchase (or claim) for the same user while the first is still
//! awaiting the store is refused instead of queued, which keeps a double
//! click from spending twice.

use std::sync::Arc;

use dashmap::DashSet;

use crate::errors::{GardenError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Purchase,
    ClaimChallenge,
    AddWaterDrops,
    Donation,
    StoryReward,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::ClaimChallenge => "claim_challenge",
            Self::AddWaterDrops => "add_water_drops",
            Self::Donation => "donation",
            Self::StoryReward => "story_reward",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Latches {
    held: Arc<DashSet<(String, OpKind)>>,
}

impl Latches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the latch for `(user_id, op)`; released when the guard drops.
    pub fn acquire(&self, user_id: &str, op: OpKind) -> Result<LatchGuard> {
        let key = (user_id.to_string(), op);
        if !self.held.insert(key.clone()) {
            return Err(GardenError::OperationInFlight(op.as_str()));
        }
        Ok(LatchGuard {
            held: Arc::clone(&self.held),
            key,
        })
    }
}

#[derive(Debug)]
pub struct LatchGuard {
    held: Arc<DashSet<(String, OpKind)>>,
    key: (String, OpKind),
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let latches = Latches::new();
        let guard = latches.acquire("u1", OpKind::Purchase).unwrap();
        assert!(matches!(
            latches.acquire("u1", OpKind::Purchase),
            Err(GardenError::OperationInFlight("purchase"))
        ));

        // Other users and other operations are independent.
        let _other_user = latches.acquire("u2", OpKind::Purchase).unwrap();
        let _other_op = latches.acquire("u1", OpKind::ClaimChallenge).unwrap();

        drop(guard);
        assert!(latches.acquire("u1", OpKind::Purchase).is_ok());
    }
}
