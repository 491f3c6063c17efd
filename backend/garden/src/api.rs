//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::content::{ContentClient, ProjectView};
use crate::context::AppContext;
use crate::db;
use crate::donation::{self, DonationRequest};
use crate::errors::{GardenError, Result};
use crate::events::WaterSource;
use crate::latch::OpKind;
use crate::records::{GardenLayout, ItemType, TransactionRecord};
use crate::session;
use crate::sync;

#[derive(Clone)]
pub struct ApiState {
    pub ctx: AppContext,
    pub content: ContentClient,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/stories", get(get_stories))
        .route("/projects", get(get_projects))
        .route("/milestones", get(get_milestones))
        .route("/districts", get(get_districts))
        .route("/donors/:id/donations", post(post_donation))
        .route("/donors/:id/transactions", get(get_transactions))
        .route("/gardens/:id", get(get_garden))
        .route("/gardens/:id/init", post(init_garden))
        .route("/gardens/:id/sync", post(sync_garden))
        .route("/gardens/:id/purchase", post(purchase))
        .route("/gardens/:id/challenges/:challenge/claim", post(claim_challenge))
        .route("/gardens/:id/daily-reset", post(daily_reset))
        .route("/gardens/:id/water", post(add_water))
        .route("/gardens/:id/layout", put(put_layout))
        .route("/admin/stats", get(admin_stats))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct TransactionsResponse {
    pub user_id: String,
    pub count: usize,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Serialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub water_drops: i64,
}

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub item_id: String,
    pub cost: i64,
    pub item_type: ItemType,
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub reward: i64,
}

#[derive(Deserialize)]
pub struct WaterRequest {
    pub amount: i64,
    #[serde(default)]
    pub source: Option<WaterSource>,
}

// ─────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────

fn status_for(err: &GardenError) -> StatusCode {
    match err {
        GardenError::AccountNotFound(_) | GardenError::GardenNotInitialized(_) => {
            StatusCode::NOT_FOUND
        }
        GardenError::InsufficientBalance { .. }
        | GardenError::AlreadyOwned(_)
        | GardenError::AlreadyClaimed(_)
        | GardenError::OperationInFlight(_) => StatusCode::CONFLICT,
        GardenError::InvalidCredentials | GardenError::NotLoggedIn => StatusCode::UNAUTHORIZED,
        GardenError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
        GardenError::StoreUnavailable(_) | GardenError::Migrate(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: GardenError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    (
        status,
        Json(serde_json::json!(ErrorResponse {
            error: err.to_string(),
            code: err.code(),
        })),
    )
        .into_response()
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(serde_json::json!(body))).into_response(),
        Err(e) => error_response(e),
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /login`
///
/// Returns the donor or admin profile matching the credentials.
pub async fn login(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let result = session::authenticate(&state.ctx.pool, &body.email, &body.password).await;
    if let Err(GardenError::InvalidCredentials) = &result {
        warn!("Login failed for {}", body.email);
    }
    respond(result)
}

/// `GET /stories`
pub async fn get_stories(State(state): State<Arc<ApiState>>) -> Response {
    respond(Ok(state.content.stories().await))
}

/// `GET /milestones`
pub async fn get_milestones(State(state): State<Arc<ApiState>>) -> Response {
    respond(Ok(state.content.milestones().await))
}

/// `GET /districts`
///
/// District boundaries as GeoJSON, or `null` when they could not be fetched.
pub async fn get_districts(State(state): State<Arc<ApiState>>) -> Response {
    respond(Ok(state.content.districts().await))
}

/// `GET /projects`
///
/// Published projects, with donations recorded here added to the raised
/// amount.
pub async fn get_projects(State(state): State<Arc<ApiState>>) -> Response {
    let projects = state.content.projects().await;
    let totals = match db::donations_by_project(&state.ctx.pool).await {
        Ok(totals) => totals,
        Err(e) => {
            warn!("Project donation totals unavailable: {e}");
            Default::default()
        }
    };
    let views: Vec<ProjectView> = projects
        .into_iter()
        .map(|project| {
            let recorded = totals.get(&project.id).copied().unwrap_or(0.0);
            ProjectView::new(project, recorded)
        })
        .collect();
    respond(Ok(views))
}

/// `POST /donors/:id/donations`
pub async fn post_donation(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
    Json(body): Json<DonationRequest>,
) -> Response {
    let ctx = &state.ctx;
    let result = async {
        let _latch = ctx.latches.acquire(&user_id, OpKind::Donation)?;
        let receipt = donation::record_donation(
            &ctx.pool,
            &user_id,
            &body,
            ctx.config.donation_reward_rate,
        )
        .await?;
        ctx.bus.water_drops_updated(
            &user_id,
            receipt.water_amount,
            Some(receipt.reward),
            WaterSource::Donation,
        );
        Ok::<_, GardenError>(receipt)
    }
    .await;
    respond(result)
}

/// `GET /donors/:id/transactions`
pub async fn get_transactions(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Response {
    let result = db::transactions_for_user(&state.ctx.pool, &user_id)
        .await
        .map(|transactions| TransactionsResponse {
            count: transactions.len(),
            user_id,
            transactions,
        });
    respond(result)
}

/// `GET /gardens/:id`
pub async fn get_garden(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Response {
    respond(sync::load_garden_state(&state.ctx.pool, &user_id).await)
}

/// `POST /gardens/:id/init`
///
/// Creates the garden on first use and re-syncs its balance otherwise.
pub async fn init_garden(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Response {
    let ctx = &state.ctx;
    respond(sync::initialize_garden_state(&ctx.pool, &user_id, ctx.canvas()).await)
}

/// `POST /gardens/:id/sync`
pub async fn sync_garden(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Response {
    let ctx = &state.ctx;
    let result = sync::sync_balance(&ctx.pool, &user_id).await.map(|water_drops| {
        ctx.bus
            .water_drops_updated(&user_id, water_drops, None, WaterSource::Sync);
        BalanceResponse {
            user_id: user_id.clone(),
            water_drops,
        }
    });
    respond(result)
}

/// `POST /gardens/:id/purchase`
pub async fn purchase(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
    Json(body): Json<PurchaseRequest>,
) -> Response {
    let ctx = &state.ctx;
    let result = async {
        let _latch = ctx.latches.acquire(&user_id, OpKind::Purchase)?;
        let water_drops =
            sync::purchase(&ctx.pool, &user_id, &body.item_id, body.cost, body.item_type).await?;
        ctx.bus.water_drops_updated(
            &user_id,
            water_drops,
            Some(-body.cost),
            WaterSource::Purchase,
        );
        Ok::<_, GardenError>(BalanceResponse {
            user_id: user_id.clone(),
            water_drops,
        })
    }
    .await;
    respond(result)
}

/// `POST /gardens/:id/challenges/:challenge/claim`
///
/// Refuses a challenge already claimed today before touching the balance.
pub async fn claim_challenge(
    State(state): State<Arc<ApiState>>,
    Path((user_id, challenge_id)): Path<(String, String)>,
    Json(body): Json<ClaimRequest>,
) -> Response {
    let ctx = &state.ctx;
    let result = async {
        let _latch = ctx.latches.acquire(&user_id, OpKind::ClaimChallenge)?;
        let garden = sync::load_garden_state(&ctx.pool, &user_id).await?;
        if garden
            .completed_challenges
            .get(&challenge_id)
            .is_some_and(|status| status.claimed)
        {
            return Err(GardenError::AlreadyClaimed(challenge_id.clone()));
        }
        let water_drops =
            sync::claim_challenge(&ctx.pool, &user_id, &challenge_id, body.reward).await?;
        ctx.bus.water_drops_updated(
            &user_id,
            water_drops,
            Some(body.reward),
            WaterSource::Challenge,
        );
        Ok::<_, GardenError>(BalanceResponse {
            user_id: user_id.clone(),
            water_drops,
        })
    }
    .await;
    respond(result)
}

/// `POST /gardens/:id/daily-reset`
pub async fn daily_reset(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Response {
    let pool = &state.ctx.pool;
    let result = async {
        sync::reset_daily_challenges(pool, &user_id).await?;
        sync::load_garden_state(pool, &user_id).await
    }
    .await;
    respond(result)
}

/// `POST /gardens/:id/water`
pub async fn add_water(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
    Json(body): Json<WaterRequest>,
) -> Response {
    let ctx = &state.ctx;
    let result = async {
        let _latch = ctx.latches.acquire(&user_id, OpKind::AddWaterDrops)?;
        let water_drops = sync::add_water_drops(&ctx.pool, &user_id, body.amount).await?;
        ctx.bus.water_drops_updated(
            &user_id,
            water_drops,
            Some(body.amount),
            body.source.unwrap_or(WaterSource::Reward),
        );
        Ok::<_, GardenError>(BalanceResponse {
            user_id: user_id.clone(),
            water_drops,
        })
    }
    .await;
    respond(result)
}

/// `PUT /gardens/:id/layout`
///
/// Stores the layout with every position clamped into the canvas and
/// returns what was stored.
pub async fn put_layout(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
    Json(mut layout): Json<GardenLayout>,
) -> Response {
    layout.clamp_all();
    let result = sync::save_layout(&state.ctx.pool, &user_id, &layout)
        .await
        .map(|()| layout);
    respond(result)
}

/// `GET /admin/stats`
pub async fn admin_stats(State(state): State<Arc<ApiState>>) -> Response {
    respond(db::donor_stats(&state.ctx.pool).await)
}
