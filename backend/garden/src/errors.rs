//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GardenError {
    #[error("No donor account for user {0}")]
    AccountNotFound(String),

    #[error("Garden for user {0} has not been initialized")]
    GardenNotInitialized(String),

    #[error("Insufficient water drops: balance {balance}, cost {cost}")]
    InsufficientBalance { balance: i64, cost: i64 },

    #[error("Item {0} is already owned")]
    AlreadyOwned(String),

    #[error("Challenge or reward {0} has already been claimed")]
    AlreadyClaimed(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("No donor is logged in")]
    NotLoggedIn,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("A {0} operation is already in flight")]
    OperationInFlight(&'static str),

    #[error("Record store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GardenError {
    /// `true` for failures caused by the backend rather than by the request.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Migrate(_))
    }

    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccountNotFound(_) => "account_not_found",
            Self::GardenNotInitialized(_) => "garden_not_initialized",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::AlreadyOwned(_) => "already_owned",
            Self::AlreadyClaimed(_) => "already_claimed",
            Self::InvalidCredentials => "invalid_credentials",
            Self::NotLoggedIn => "not_logged_in",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::OperationInFlight(_) => "operation_in_flight",
            Self::StoreUnavailable(_) | Self::Migrate(_) => "store_unavailable",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, GardenError>;
