//! Sync layer — keeps the garden's balance mirror in step with the donor
//! balance and performs every currency-changing dual write.
//!
//! ## Consistency
//!
//! * The donor's `water_amount` is the only balance any decision is based on.
//! * Each dual write (donor balance + garden record) runs in one store
//!   transaction, so after any call here returns `Ok` the garden's
//!   `water_drops` equals the donor's `water_amount`.
//! * Writers outside this module (donations) only touch the donor record;
//!   [`sync_balance`] heals the mirror afterwards.

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db;
use crate::errors::{GardenError, Result};
use crate::records::{CanvasSize, ChallengeStatus, GardenLayout, GardenStateRecord, ItemType};

/// Largest single credit, debit or reward accepted. Balances stay far below
/// the point where SQLite integer arithmetic would overflow.
pub const MAX_AMOUNT: i64 = 1_000_000_000;

fn check_amount(what: &str, amount: i64) -> Result<()> {
    if amount < 0 {
        return Err(GardenError::InvalidAmount(format!("negative {what} {amount}")));
    }
    if amount > MAX_AMOUNT {
        return Err(GardenError::InvalidAmount(format!(
            "{what} {amount} exceeds the limit of {MAX_AMOUNT}"
        )));
    }
    Ok(())
}

/// The calendar day used for daily challenge resets.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Create the garden record on first use, otherwise re-sync its balance.
///
/// A new record is seeded with the default free items and the donor's
/// current balance.
pub async fn initialize_garden_state(
    pool: &SqlitePool,
    user_id: &str,
    canvas: CanvasSize,
) -> Result<GardenStateRecord> {
    let balance = db::get_water_amount(pool, user_id)
        .await?
        .ok_or_else(|| GardenError::AccountNotFound(user_id.to_string()))?;

    let seeded = GardenStateRecord::seeded(user_id, balance, canvas);
    if db::insert_garden(pool, &seeded).await? {
        info!(user_id, balance, "Created garden state");
        return Ok(seeded);
    }

    sync_balance(pool, user_id).await?;
    load_garden_state(pool, user_id).await
}

/// Copy the donor balance into the garden mirror and return it.
pub async fn sync_balance(pool: &SqlitePool, user_id: &str) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let corrected = db::copy_balance_to_mirror(&mut *tx, user_id).await?;
    let balance = db::get_water_amount(&mut *tx, user_id)
        .await?
        .ok_or_else(|| GardenError::AccountNotFound(user_id.to_string()))?;

    tx.commit().await?;

    if corrected > 0 {
        info!(user_id, balance, "Corrected drifted garden balance");
    } else {
        debug!(user_id, balance, "Garden balance already in sync");
    }
    Ok(balance)
}

/// Spend `cost` water drops on `item_id`. Returns the new balance.
///
/// Fails without writing anything when the balance is short or the item is
/// already owned.
pub async fn purchase(
    pool: &SqlitePool,
    user_id: &str,
    item_id: &str,
    cost: i64,
    item_type: ItemType,
) -> Result<i64> {
    check_amount("cost", cost)?;

    // Dropping `tx` on an early return rolls the decrement back.
    let mut tx = pool.begin().await?;

    let Some(new_balance) = db::adjust_water_amount(&mut *tx, user_id, -cost).await? else {
        let balance = db::get_water_amount(&mut *tx, user_id)
            .await?
            .ok_or_else(|| GardenError::AccountNotFound(user_id.to_string()))?;
        return Err(GardenError::InsufficientBalance { balance, cost });
    };

    let mut garden = db::get_garden(&mut *tx, user_id)
        .await?
        .ok_or_else(|| GardenError::GardenNotInitialized(user_id.to_string()))?;

    if !garden.owned_mut(item_type).insert(item_id.to_string()) {
        return Err(GardenError::AlreadyOwned(item_id.to_string()));
    }

    db::save_owned_items(
        &mut *tx,
        user_id,
        item_type,
        garden.owned(item_type),
        new_balance,
    )
    .await?;
    tx.commit().await?;

    info!(user_id, item_id, %item_type, cost, new_balance, "Purchased garden item");
    Ok(new_balance)
}

/// Credit `reward` and mark `challenge_id` as completed and claimed.
///
/// Does not check for an earlier claim; callers guard against that.
pub async fn claim_challenge(
    pool: &SqlitePool,
    user_id: &str,
    challenge_id: &str,
    reward: i64,
) -> Result<i64> {
    check_amount("reward", reward)?;

    let mut tx = pool.begin().await?;

    let new_balance = db::adjust_water_amount(&mut *tx, user_id, reward)
        .await?
        .ok_or_else(|| GardenError::AccountNotFound(user_id.to_string()))?;

    let mut garden = db::get_garden(&mut *tx, user_id)
        .await?
        .ok_or_else(|| GardenError::GardenNotInitialized(user_id.to_string()))?;

    garden.completed_challenges.insert(
        challenge_id.to_string(),
        ChallengeStatus {
            completed: true,
            claimed: true,
            last_claim_date: Some(today()),
        },
    );

    db::save_challenges(&mut *tx, user_id, &garden.completed_challenges, new_balance).await?;
    tx.commit().await?;

    info!(user_id, challenge_id, reward, new_balance, "Claimed challenge");
    Ok(new_balance)
}

/// Clear today's challenge progress. Safe to repeat within a day.
pub async fn reset_daily_challenges(pool: &SqlitePool, user_id: &str) -> Result<()> {
    reset_daily_challenges_on(pool, user_id, today()).await
}

pub async fn reset_daily_challenges_on(
    pool: &SqlitePool,
    user_id: &str,
    day: NaiveDate,
) -> Result<()> {
    require_donor(pool, user_id).await?;

    if db::reset_challenges(pool, user_id, day).await? == 0 {
        return Err(GardenError::GardenNotInitialized(user_id.to_string()));
    }
    info!(user_id, %day, "Daily challenges reset");
    Ok(())
}

/// Credit `amount` water drops. Returns the new balance.
///
/// The garden mirror is updated when the garden exists; a donor without a
/// garden yet just gets the credit.
pub async fn add_water_drops(pool: &SqlitePool, user_id: &str, amount: i64) -> Result<i64> {
    check_amount("amount", amount)?;

    let mut tx = pool.begin().await?;

    let new_balance = db::adjust_water_amount(&mut *tx, user_id, amount)
        .await?
        .ok_or_else(|| GardenError::AccountNotFound(user_id.to_string()))?;
    db::set_garden_water_drops(&mut *tx, user_id, new_balance).await?;

    tx.commit().await?;

    debug!(user_id, amount, new_balance, "Added water drops");
    Ok(new_balance)
}

pub async fn load_garden_state(pool: &SqlitePool, user_id: &str) -> Result<GardenStateRecord> {
    require_donor(pool, user_id).await?;
    db::get_garden(pool, user_id)
        .await?
        .ok_or_else(|| GardenError::GardenNotInitialized(user_id.to_string()))
}

/// Persist the placed layout, clamping anything outside the canvas.
pub async fn save_layout(pool: &SqlitePool, user_id: &str, layout: &GardenLayout) -> Result<()> {
    let mut layout = layout.clone();
    layout.clamp_all();

    if db::save_layout(pool, user_id, &layout).await? == 0 {
        require_donor(pool, user_id).await?;
        return Err(GardenError::GardenNotInitialized(user_id.to_string()));
    }
    debug!(
        user_id,
        plants = layout.plants.len(),
        accessories = layout.accessories.len(),
        "Saved garden layout"
    );
    Ok(())
}

async fn require_donor(pool: &SqlitePool, user_id: &str) -> Result<i64> {
    db::get_water_amount(pool, user_id)
        .await?
        .ok_or_else(|| GardenError::AccountNotFound(user_id.to_string()))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
