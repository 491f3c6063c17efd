//! Shared handles injected into every controller and API handler.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::events::EventBus;
use crate::latch::Latches;
use crate::records::CanvasSize;

#[derive(Debug, Clone)]
pub struct AppContext {
    pub pool: SqlitePool,
    pub bus: EventBus,
    pub latches: Latches,
    pub config: Arc<Config>,
}

impl AppContext {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        Self {
            pool,
            bus: EventBus::new(),
            latches: Latches::new(),
            config: Arc::new(config),
        }
    }

    pub fn canvas(&self) -> CanvasSize {
        CanvasSize {
            width: self.config.canvas_width,
            height: self.config.canvas_height,
        }
    }
}
