//! HTTP surface.
//!
//! - `GET    /health`
//! - `GET    /api/opportunities/related?industry=&exclude=&limit=`
//! - `GET    /api/opportunities/:id/price?window=`
//! - `GET    /api/opportunities/:id/quote`
//! - `GET    /api/opportunities/:id/bid-info`
//! - `GET    /api/opportunities/:id/pitch-status`
//! - `PUT    /api/opportunities/:id/draft`
//! - `POST   /api/opportunities/:id/draft/autosave`
//! - `DELETE /api/opportunities/:id/draft`
//! - `POST   /api/opportunities/:id/pitch`

use crate::auth::{AuthenticatedUser, MaybeUser};
use crate::error::{AppError, AppResult};
use crate::models::Draft;
use crate::services::query_service::DEFAULT_WINDOW;
use crate::services::{
    BidInfo, PriceTrendView, PriceWindow, RelatedOpportunity, SubmissionReceipt, UserPitchStatus,
};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/opportunities/related", get(related_opportunities))
        .route("/api/opportunities/:id/price", get(price_trend))
        .route("/api/opportunities/:id/quote", get(live_quote))
        .route("/api/opportunities/:id/bid-info", get(bid_info))
        .route("/api/opportunities/:id/pitch-status", get(pitch_status))
        .route(
            "/api/opportunities/:id/draft",
            put(save_draft).delete(discard_draft),
        )
        .route("/api/opportunities/:id/draft/autosave", post(autosave_draft))
        .route("/api/opportunities/:id/pitch", post(submit_pitch))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Opportunities with at least one live price subscriber
    pub price_channels: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        price_channels: state.broadcaster.channel_count().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PriceTrendResponse {
    #[serde(flatten)]
    pub trend: PriceTrendView,
    pub window: String,
    pub watchers: usize,
}

async fn price_trend(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<WindowQuery>,
    _user: MaybeUser,
) -> AppResult<Json<PriceTrendResponse>> {
    let window_raw = query.window.unwrap_or_else(|| DEFAULT_WINDOW.to_string());
    let window = PriceWindow::parse(&window_raw)?;

    let trend = state.queries.price_trend(id, window).await?;
    let watchers = state.broadcaster.connection_count(id).await;

    Ok(Json(PriceTrendResponse {
        trend,
        window: window_raw.to_lowercase(),
        watchers,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub opportunity_id: Uuid,
    pub quote: Decimal,
}

async fn live_quote(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<QuoteResponse>> {
    let quote = state.queries.live_quote(id).await?;
    Ok(Json(QuoteResponse {
        opportunity_id: id,
        quote,
    }))
}

async fn bid_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<BidInfo>> {
    Ok(Json(state.queries.bid_info(id).await?))
}

async fn pitch_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> AppResult<Json<UserPitchStatus>> {
    Ok(Json(state.pitches.get_user_pitch_status(user_id, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RelatedQuery {
    pub industry: Option<String>,
    pub exclude: Option<Uuid>,
    pub limit: Option<usize>,
}

async fn related_opportunities(
    State(state): State<AppState>,
    Query(query): Query<RelatedQuery>,
) -> AppResult<Json<Vec<RelatedOpportunity>>> {
    let industry = query
        .industry
        .ok_or_else(|| AppError::Validation("industry is required".to_string()))?;
    Ok(Json(
        state
            .queries
            .related_opportunities(&industry, query.exclude, query.limit)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct DraftRequest {
    pub content: String,
}

async fn save_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(req): Json<DraftRequest>,
) -> AppResult<Json<Draft>> {
    Ok(Json(state.pitches.save_draft(user_id, id, &req.content).await?))
}

async fn autosave_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(req): Json<DraftRequest>,
) -> StatusCode {
    // Accepted either way; a dropped autosave is not an error for the client
    state.autosave.enqueue(user_id, id, req.content).await;
    StatusCode::ACCEPTED
}

async fn discard_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> AppResult<StatusCode> {
    state.pitches.discard_draft(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PitchRequest {
    pub content: String,
    #[serde(default)]
    pub claimed_price: Option<Decimal>,
}

async fn submit_pitch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(req): Json<PitchRequest>,
) -> AppResult<(StatusCode, Json<SubmissionReceipt>)> {
    let receipt = state
        .pitches
        .submit_pitch(user_id, id, &req.content, req.claimed_price)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}
