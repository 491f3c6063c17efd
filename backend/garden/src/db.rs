//! Record store — connection pool, migrations and typed record access.
//!
//! Every helper is generic over [`SqliteExecutor`] so the sync layer can run
//! several of them inside one transaction, while simple reads take the pool.
//!
//! Balance columns are only ever changed with in-place arithmetic
//! (`water_amount = water_amount + ?`), never by writing back a value read
//! earlier, so concurrent writers cannot lose each other's updates.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::records::{
    AdminRecord, ChallengeStatus, DonorRecord, GardenLayout, GardenStateRecord, ItemType,
    TransactionRecord,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // An in-memory database lives and dies with its connection.
    let pool_options = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Accounts
// ─────────────────────────────────────────────────────────

/// Provision a donor account.
pub async fn create_donor<'e, E: SqliteExecutor<'e>>(exec: E, donor: &DonorRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO donors
            (user_id, name, email, password, district_id, donated_amount, water_amount, inventory)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&donor.user_id)
    .bind(&donor.name)
    .bind(&donor.email)
    .bind(&donor.password)
    .bind(donor.district_id)
    .bind(donor.donated_amount)
    .bind(donor.water_amount)
    .bind(Json(&donor.inventory))
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn create_admin<'e, E: SqliteExecutor<'e>>(exec: E, admin: &AdminRecord) -> Result<()> {
    sqlx::query("INSERT INTO admins (admin_id, name, email, password) VALUES (?1, ?2, ?3, ?4)")
        .bind(&admin.admin_id)
        .bind(&admin.name)
        .bind(&admin.email)
        .bind(&admin.password)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get_donor<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
) -> Result<Option<DonorRecord>> {
    let row = sqlx::query_as::<_, DonorRecord>(
        r#"
        SELECT user_id, name, email, password, district_id, donated_amount,
               water_amount, inventory
        FROM   donors
        WHERE  user_id = ?1
        "#,
    )
    .bind(user_id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

pub async fn find_donor_by_email<'e, E: SqliteExecutor<'e>>(
    exec: E,
    email: &str,
) -> Result<Option<DonorRecord>> {
    let row = sqlx::query_as::<_, DonorRecord>(
        r#"
        SELECT user_id, name, email, password, district_id, donated_amount,
               water_amount, inventory
        FROM   donors
        WHERE  email = ?1
        "#,
    )
    .bind(email)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

pub async fn find_admin_by_email<'e, E: SqliteExecutor<'e>>(
    exec: E,
    email: &str,
) -> Result<Option<AdminRecord>> {
    let row = sqlx::query_as::<_, AdminRecord>(
        "SELECT admin_id, name, email, password FROM admins WHERE email = ?1",
    )
    .bind(email)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

/// Read only the canonical balance.
pub async fn get_water_amount<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
) -> Result<Option<i64>> {
    let row = sqlx::query_scalar::<_, i64>("SELECT water_amount FROM donors WHERE user_id = ?1")
        .bind(user_id)
        .fetch_optional(exec)
        .await?;
    Ok(row)
}

/// Atomically add `delta` (which may be negative) to the donor balance.
///
/// The update only applies when the result stays non-negative. Returns the
/// new balance, or `None` when the donor is missing or the balance would
/// go below zero.
pub async fn adjust_water_amount<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    delta: i64,
) -> Result<Option<i64>> {
    let row = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE donors
        SET    water_amount = water_amount + ?1
        WHERE  user_id = ?2 AND water_amount + ?1 >= 0
        RETURNING water_amount
        "#,
    )
    .bind(delta)
    .bind(user_id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

/// Credit a donation and its water-drop reward in one statement.
///
/// Returns `(donated_amount, water_amount)` after the update, or `None` when
/// the donor does not exist.
pub async fn credit_donation<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    amount: f64,
    reward: i64,
) -> Result<Option<(f64, i64)>> {
    let row = sqlx::query_as::<_, (f64, i64)>(
        r#"
        UPDATE donors
        SET    donated_amount = donated_amount + ?1,
               water_amount   = water_amount + ?2
        WHERE  user_id = ?3
        RETURNING donated_amount, water_amount
        "#,
    )
    .bind(amount)
    .bind(reward)
    .bind(user_id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────

/// A donation about to be appended to the transaction log.
#[derive(Debug, Clone, Serialize)]
pub struct NewTransaction<'a> {
    pub user_id: &'a str,
    pub amount: f64,
    pub target_district_id: i64,
    pub project_id: Option<&'a str>,
    pub project_title: Option<&'a str>,
}

/// Append a donation record. Returns the stored row.
pub async fn insert_transaction<'e, E: SqliteExecutor<'e>>(
    exec: E,
    tx: &NewTransaction<'_>,
) -> Result<TransactionRecord> {
    let row = sqlx::query_as::<_, TransactionRecord>(
        r#"
        INSERT INTO transactions
            (user_id, amount, target_district_id, project_id, project_title, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING id, user_id, amount, target_district_id, project_id, project_title, timestamp
        "#,
    )
    .bind(tx.user_id)
    .bind(tx.amount)
    .bind(tx.target_district_id)
    .bind(tx.project_id)
    .bind(tx.project_title)
    .bind(Utc::now().timestamp())
    .fetch_one(exec)
    .await?;
    Ok(row)
}

/// All donations by one user, oldest first.
pub async fn transactions_for_user<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
) -> Result<Vec<TransactionRecord>> {
    let rows = sqlx::query_as::<_, TransactionRecord>(
        r#"
        SELECT id, user_id, amount, target_district_id, project_id, project_title, timestamp
        FROM   transactions
        WHERE  user_id = ?1
        ORDER  BY timestamp ASC, id ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(exec)
    .await?;
    Ok(rows)
}

/// Total donated per project across all donors.
pub async fn donations_by_project<'e, E: SqliteExecutor<'e>>(
    exec: E,
) -> Result<BTreeMap<String, f64>> {
    let rows = sqlx::query_as::<_, (String, f64)>(
        r#"
        SELECT project_id, SUM(amount)
        FROM   transactions
        WHERE  project_id IS NOT NULL
        GROUP  BY project_id
        "#,
    )
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().collect())
}

// ─────────────────────────────────────────────────────────
// Garden state
// ─────────────────────────────────────────────────────────

pub async fn get_garden<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
) -> Result<Option<GardenStateRecord>> {
    let row = sqlx::query_as::<_, GardenStateRecord>(
        r#"
        SELECT user_id, current_garden, owned_plants, owned_accessories, owned_themes,
               water_drops, last_daily_reset_date, completed_challenges, updated_at
        FROM   user_gardens
        WHERE  user_id = ?1
        "#,
    )
    .bind(user_id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

/// Create a garden record. An existing record for the same user is kept.
///
/// Returns `true` when a new row was written.
pub async fn insert_garden<'e, E: SqliteExecutor<'e>>(
    exec: E,
    garden: &GardenStateRecord,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT OR IGNORE INTO user_gardens
            (user_id, current_garden, owned_plants, owned_accessories, owned_themes,
             water_drops, last_daily_reset_date, completed_challenges, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&garden.user_id)
    .bind(Json(&garden.current_garden))
    .bind(Json(&garden.owned_plants))
    .bind(Json(&garden.owned_accessories))
    .bind(Json(&garden.owned_themes))
    .bind(garden.water_drops)
    .bind(garden.last_daily_reset_date)
    .bind(Json(&garden.completed_challenges))
    .bind(garden.updated_at)
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Overwrite the balance mirror. Returns the number of rows touched.
pub async fn set_garden_water_drops<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    water_drops: i64,
) -> Result<u64> {
    let rows = sqlx::query(
        "UPDATE user_gardens SET water_drops = ?1, updated_at = ?2 WHERE user_id = ?3",
    )
    .bind(water_drops)
    .bind(Utc::now().timestamp())
    .bind(user_id)
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Copy the canonical balance into the mirror when they differ.
///
/// Done in a single statement so the copied value is the one current at
/// write time. Returns the number of rows corrected (0 or 1).
pub async fn copy_balance_to_mirror<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE user_gardens
        SET    water_drops = (SELECT d.water_amount FROM donors d WHERE d.user_id = user_gardens.user_id),
               updated_at  = ?2
        WHERE  user_id = ?1
          AND  water_drops != (SELECT d.water_amount FROM donors d WHERE d.user_id = user_gardens.user_id)
        "#,
    )
    .bind(user_id)
    .bind(Utc::now().timestamp())
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Replace one owned-item set and the balance mirror together.
pub async fn save_owned_items<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    item_type: ItemType,
    owned: &BTreeSet<String>,
    water_drops: i64,
) -> Result<u64> {
    let column = match item_type {
        ItemType::Plant => "owned_plants",
        ItemType::Accessory => "owned_accessories",
        ItemType::Theme => "owned_themes",
    };
    let sql = format!(
        "UPDATE user_gardens SET {column} = ?1, water_drops = ?2, updated_at = ?3 WHERE user_id = ?4"
    );
    let rows = sqlx::query(&sql)
        .bind(Json(owned))
        .bind(water_drops)
        .bind(Utc::now().timestamp())
        .bind(user_id)
        .execute(exec)
        .await?
        .rows_affected();
    Ok(rows)
}

/// Replace the challenge map and the balance mirror together.
pub async fn save_challenges<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    challenges: &BTreeMap<String, ChallengeStatus>,
    water_drops: i64,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE user_gardens
        SET    completed_challenges = ?1, water_drops = ?2, updated_at = ?3
        WHERE  user_id = ?4
        "#,
    )
    .bind(Json(challenges))
    .bind(water_drops)
    .bind(Utc::now().timestamp())
    .bind(user_id)
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Clear challenge progress and stamp the reset date.
pub async fn reset_challenges<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    today: NaiveDate,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE user_gardens
        SET    completed_challenges = '{}', last_daily_reset_date = ?1, updated_at = ?2
        WHERE  user_id = ?3
        "#,
    )
    .bind(today)
    .bind(Utc::now().timestamp())
    .bind(user_id)
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Persist the placed layout.
pub async fn save_layout<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    layout: &GardenLayout,
) -> Result<u64> {
    let rows = sqlx::query(
        "UPDATE user_gardens SET current_garden = ?1, updated_at = ?2 WHERE user_id = ?3",
    )
    .bind(Json(layout))
    .bind(Utc::now().timestamp())
    .bind(user_id)
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Admin statistics
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DistrictTotal {
    pub district_id: i64,
    pub donor_count: i64,
    pub total_donated: f64,
    pub total_water: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DonorStats {
    pub donor_count: i64,
    pub total_donated: f64,
    pub total_water: i64,
    /// Districts ordered by amount donated, highest first.
    pub districts: Vec<DistrictTotal>,
}

/// Aggregate donor statistics for the admin dashboard.
pub async fn donor_stats(pool: &SqlitePool) -> Result<DonorStats> {
    let (donor_count, total_donated, total_water) = sqlx::query_as::<_, (i64, f64, i64)>(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(donated_amount), 0.0),
               COALESCE(SUM(water_amount), 0)
        FROM   donors
        "#,
    )
    .fetch_one(pool)
    .await?;

    let districts = sqlx::query_as::<_, DistrictTotal>(
        r#"
        SELECT district_id,
               COUNT(*)                            AS donor_count,
               COALESCE(SUM(donated_amount), 0.0)  AS total_donated,
               COALESCE(SUM(water_amount), 0)      AS total_water
        FROM   donors
        GROUP  BY district_id
        ORDER  BY total_donated DESC, district_id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(DonorStats {
        donor_count,
        total_donated,
        total_water,
        districts,
    })
}

// ─────────────────────────────────────────────────────────
// Test fixtures
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub async fn memory_pool() -> SqlitePool {
        init_pool("sqlite::memory:").await.unwrap()
    }

    pub fn donor(user_id: &str, water_amount: i64) -> DonorRecord {
        DonorRecord {
            user_id: user_id.to_string(),
            name: format!("Donor {user_id}"),
            email: format!("{user_id}@example.org"),
            password: "hunter2".to_string(),
            district_id: 1,
            donated_amount: 0.0,
            water_amount,
            inventory: BTreeSet::new(),
        }
    }

    /// A pool holding one donor with the given balance.
    pub async fn pool_with_donor(user_id: &str, water_amount: i64) -> SqlitePool {
        let pool = memory_pool().await;
        create_donor(&pool, &donor(user_id, water_amount))
            .await
            .unwrap();
        pool
    }
}
