//! Record shapes held by the record store.
//!
//! Two records exist per user:
//!
//! - [`DonorRecord`] — canonical identity, donation totals and the spendable
//!   water-drop balance (`water_amount`).
//! - [`GardenStateRecord`] — derived gameplay state: owned items, the placed
//!   layout, challenge progress and `water_drops`, a cached mirror of the
//!   donor balance.
//!
//! The mirror is only ever written by the sync layer and is never trusted for
//! authorization; every spend re-reads the donor balance.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Minimum distance between a placed item and the canvas edge.
pub const CANVAS_MARGIN: f64 = 50.0;

pub const DEFAULT_PLANTS: &[&str] = &["sunflower"];
pub const DEFAULT_ACCESSORIES: &[&str] = &[];
pub const DEFAULT_THEMES: &[&str] = &["meadow"];
pub const DEFAULT_BACKGROUND: &str = "meadow";

// ─────────────────────────────────────────────────────────
// Accounts
// ─────────────────────────────────────────────────────────

/// Canonical donor account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DonorRecord {
    pub user_id: String,
    pub name: String,
    pub email: String,
    /// Stored as provisioned: either an Argon2 PHC string or legacy plaintext.
    #[serde(skip_serializing, default)]
    pub password: String,
    pub district_id: i64,
    pub donated_amount: f64,
    pub water_amount: i64,
    #[sqlx(json)]
    pub inventory: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminRecord {
    pub admin_id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

/// One entry of the append-only donation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: String,
    pub amount: f64,
    pub target_district_id: i64,
    pub project_id: Option<String>,
    pub project_title: Option<String>,
    pub timestamp: i64,
}

// ─────────────────────────────────────────────────────────
// Ownership
// ─────────────────────────────────────────────────────────

/// The kinds of purchasable garden items. Each has its own owned-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Plant,
    Accessory,
    Theme,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plant => "plant",
            Self::Accessory => "accessory",
            Self::Theme => "theme",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plant" => Ok(Self::Plant),
            "accessory" => Ok(Self::Accessory),
            "theme" | "background" => Ok(Self::Theme),
            other => Err(format!("unknown item type `{other}`")),
        }
    }
}

/// Progress on a single challenge for the current day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeStatus {
    pub completed: bool,
    pub claimed: bool,
    pub last_claim_date: Option<NaiveDate>,
}

// ─────────────────────────────────────────────────────────
// Layout
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: f64,
    pub height: f64,
}

impl CanvasSize {
    /// Clamp `pos` into `[50, width-50] x [50, height-50]`.
    ///
    /// A canvas narrower than twice the margin collapses the range to the
    /// margin itself; non-finite coordinates land on the margin.
    pub fn clamp(&self, pos: Position) -> Position {
        Position {
            x: clamp_axis(pos.x, self.width),
            y: clamp_axis(pos.y, self.height),
        }
    }
}

fn clamp_axis(value: f64, extent: f64) -> f64 {
    let upper = (extent - CANVAS_MARGIN).max(CANVAS_MARGIN);
    if value.is_nan() {
        return CANVAS_MARGIN;
    }
    value.max(CANVAS_MARGIN).min(upper)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantInstance {
    pub id: String,
    pub plant_type: String,
    pub position: Position,
    pub scale: f64,
    pub is_placement_mode: bool,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoryInstance {
    pub id: String,
    pub accessory_type: String,
    pub position: Position,
    pub is_placement_mode: bool,
    pub placed_at: DateTime<Utc>,
}

/// Public-sharing metadata for a garden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingInfo {
    pub is_public: bool,
    pub share_code: String,
    pub shared_at: DateTime<Utc>,
}

/// The placed contents of a user's garden canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GardenLayout {
    pub plants: Vec<PlantInstance>,
    pub accessories: Vec<AccessoryInstance>,
    pub background_theme: String,
    pub canvas: CanvasSize,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<SharingInfo>,
}

impl GardenLayout {
    pub fn empty(canvas: CanvasSize) -> Self {
        Self {
            plants: Vec::new(),
            accessories: Vec::new(),
            background_theme: DEFAULT_BACKGROUND.to_string(),
            canvas,
            last_modified: Utc::now(),
            sharing: None,
        }
    }

    /// Pull every placed item back inside the canvas.
    pub fn clamp_all(&mut self) {
        let canvas = self.canvas;
        for plant in &mut self.plants {
            plant.position = canvas.clamp(plant.position);
        }
        for accessory in &mut self.accessories {
            accessory.position = canvas.clamp(accessory.position);
        }
    }
}

// ─────────────────────────────────────────────────────────
// Garden state
// ─────────────────────────────────────────────────────────

/// Derived gameplay record, 1:1 with [`DonorRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GardenStateRecord {
    pub user_id: String,
    #[sqlx(json)]
    pub current_garden: GardenLayout,
    #[sqlx(json)]
    pub owned_plants: BTreeSet<String>,
    #[sqlx(json)]
    pub owned_accessories: BTreeSet<String>,
    #[sqlx(json)]
    pub owned_themes: BTreeSet<String>,
    /// Mirror of `DonorRecord::water_amount`. A cache, not a source of truth.
    pub water_drops: i64,
    pub last_daily_reset_date: Option<NaiveDate>,
    #[sqlx(json)]
    pub completed_challenges: BTreeMap<String, ChallengeStatus>,
    pub updated_at: i64,
}

impl GardenStateRecord {
    /// A freshly seeded garden holding the default free items.
    pub fn seeded(user_id: &str, water_drops: i64, canvas: CanvasSize) -> Self {
        Self {
            user_id: user_id.to_string(),
            current_garden: GardenLayout::empty(canvas),
            owned_plants: to_set(DEFAULT_PLANTS),
            owned_accessories: to_set(DEFAULT_ACCESSORIES),
            owned_themes: to_set(DEFAULT_THEMES),
            water_drops,
            last_daily_reset_date: None,
            completed_challenges: BTreeMap::new(),
            updated_at: Utc::now().timestamp(),
        }
    }

    pub fn owned(&self, item_type: ItemType) -> &BTreeSet<String> {
        match item_type {
            ItemType::Plant => &self.owned_plants,
            ItemType::Accessory => &self.owned_accessories,
            ItemType::Theme => &self.owned_themes,
        }
    }

    pub fn owned_mut(&mut self, item_type: ItemType) -> &mut BTreeSet<String> {
        match item_type {
            ItemType::Plant => &mut self.owned_plants,
            ItemType::Accessory => &mut self.owned_accessories,
            ItemType::Theme => &mut self.owned_themes,
        }
    }
}

pub fn to_set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
