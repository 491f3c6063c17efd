//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{GardenError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL for the record store
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Base URL that static content (stories, projects, milestones) is served from
    pub content_base_url: String,
    /// File backing the local device storage
    pub device_storage_path: PathBuf,
    /// Quiet period after the last layout change before it is written
    pub layout_save_debounce: Duration,
    /// Water drops earned per unit donated
    pub donation_reward_rate: f64,
    /// Water drops granted for reading an impact story
    pub story_reward: i64,
    /// Default garden canvas width
    pub canvas_width: f64,
    /// Default garden canvas height
    pub canvas_height: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite:./reach_garden.db".to_string(),
            api_port: 3001,
            content_base_url: "http://localhost:3000".to_string(),
            device_storage_path: PathBuf::from("./device_storage.json"),
            layout_save_debounce: Duration::from_secs(2),
            donation_reward_rate: 5.0,
            story_reward: 10,
            canvas_width: 800.0,
            canvas_height: 600.0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Config {
            database_url: env_var("DATABASE_URL").unwrap_or(defaults.database_url),
            api_port: parse_or("API_PORT", defaults.api_port)?,
            content_base_url: env_var("CONTENT_BASE_URL").unwrap_or(defaults.content_base_url),
            device_storage_path: env_var("DEVICE_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.device_storage_path),
            layout_save_debounce: Duration::from_millis(parse_or(
                "LAYOUT_SAVE_DEBOUNCE_MS",
                defaults.layout_save_debounce.as_millis() as u64,
            )?),
            donation_reward_rate: parse_or("DONATION_REWARD_RATE", defaults.donation_reward_rate)?,
            story_reward: parse_or("STORY_REWARD", defaults.story_reward)?,
            canvas_width: parse_or("CANVAS_WIDTH", defaults.canvas_width)?,
            canvas_height: parse_or("CANVAS_HEIGHT", defaults.canvas_height)?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| GardenError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| GardenError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
