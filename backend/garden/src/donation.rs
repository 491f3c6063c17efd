//! Donation processing — credits the donor, rewards water drops and appends
//! the transaction log entry in one store transaction.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::{self, NewTransaction};
use crate::errors::{GardenError, Result};
use crate::records::TransactionRecord;
use crate::sync;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationRequest {
    pub amount: f64,
    pub target_district_id: i64,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DonationReceipt {
    pub transaction: TransactionRecord,
    /// Water drops earned by this donation.
    pub reward: i64,
    pub donated_amount: f64,
    pub water_amount: i64,
}

/// Water drops earned for donating `amount` at `rate` drops per unit.
pub fn reward_for(amount: f64, rate: f64) -> i64 {
    (amount * rate).floor() as i64
}

pub async fn record_donation(
    pool: &SqlitePool,
    user_id: &str,
    request: &DonationRequest,
    reward_rate: f64,
) -> Result<DonationReceipt> {
    if !request.amount.is_finite() || request.amount <= 0.0 {
        return Err(GardenError::InvalidAmount(format!(
            "donation must be positive, got {}",
            request.amount
        )));
    }
    let reward = reward_for(request.amount, reward_rate);
    if reward > sync::MAX_AMOUNT {
        return Err(GardenError::InvalidAmount(format!(
            "donation of {} earns more than {} drops",
            request.amount,
            sync::MAX_AMOUNT
        )));
    }

    let mut tx = pool.begin().await?;

    let (donated_amount, water_amount) =
        db::credit_donation(&mut *tx, user_id, request.amount, reward)
            .await?
            .ok_or_else(|| GardenError::AccountNotFound(user_id.to_string()))?;

    let transaction = db::insert_transaction(
        &mut *tx,
        &NewTransaction {
            user_id,
            amount: request.amount,
            target_district_id: request.target_district_id,
            project_id: request.project_id.as_deref(),
            project_title: request.project_title.as_deref(),
        },
    )
    .await?;

    tx.commit().await?;

    info!(
        user_id,
        amount = request.amount,
        district = request.target_district_id,
        reward,
        water_amount,
        "Donation recorded"
    );

    Ok(DonationReceipt {
        transaction,
        reward,
        donated_amount,
        water_amount,
    })
}
