//! Reach Together garden service — entry point.
//!
//! Opens the SQLite record store (running migrations) and serves the garden
//! REST API over it.

use std::sync::Arc;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reach_garden::api::{self, ApiState};
use reach_garden::config::Config;
use reach_garden::content::ContentClient;
use reach_garden::context::AppContext;
use reach_garden::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // HTTP client for static content fetches.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let content = ContentClient::new(client, &config.content_base_url);

    let addr = format!("0.0.0.0:{}", config.api_port);
    let ctx = AppContext::new(pool, config);

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState { ctx, content }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
