//! HTTP handlers
//!
//! Writes go through the engine pipeline; reads only touch the query facade.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use kudos::engine::{ActionOutcome, EngineStats};
use kudos::query::{BadgeProgress, LeaderboardPage, MissionProgress, UserStats};
use kudos::{ActionRequest, AwardReceipt, AwardRequest, LeaderboardScope, Level, PointEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::AppState;

const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_HISTORY: usize = 50;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

// === Writes ===

fn outcome_status(outcome: &ActionOutcome) -> StatusCode {
    if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

/// POST /api/actions
pub async fn record_action(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActionRequest>,
) -> ApiResult<(StatusCode, Json<ActionOutcome>)> {
    let outcome = state.engine.record_action(request).await?;
    Ok((outcome_status(&outcome), Json(outcome)))
}

/// POST /api/awards
pub async fn award_points(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AwardRequest>,
) -> ApiResult<(StatusCode, Json<ActionOutcome>)> {
    let outcome = state.engine.award_points(request).await?;
    Ok((outcome_status(&outcome), Json(outcome)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReverseBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct ReverseResponse {
    pub event: PointEvent,
    pub duplicate: bool,
}

/// POST /api/events/:id/reverse
pub async fn reverse_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
    body: Option<Json<ReverseBody>>,
) -> ApiResult<(StatusCode, Json<ReverseResponse>)> {
    let reason = body.and_then(|Json(b)| b.reason);
    let receipt = state.engine.reverse(&event_id, reason).await?;
    let (status, duplicate) = match &receipt {
        AwardReceipt::Recorded(_) => (StatusCode::CREATED, false),
        AwardReceipt::Duplicate(_) => (StatusCode::OK, true),
    };
    Ok((
        status,
        Json(ReverseResponse {
            event: receipt.into_event(),
            duplicate,
        }),
    ))
}

#[derive(Serialize)]
pub struct RebuildResponse {
    pub version: u64,
    pub stats: EngineStats,
}

/// POST /api/admin/rebuild
pub async fn rebuild(State(state): State<Arc<AppState>>) -> ApiResult<Json<RebuildResponse>> {
    let version = state.engine.rebuild().await?;
    Ok(Json(RebuildResponse {
        version,
        stats: state.engine.stats().await,
    }))
}

/// GET /api/admin/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.engine.stats().await)
}

// === Reads ===

/// GET /api/users/:id/stats
pub async fn user_stats(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserStats>> {
    Ok(Json(state.engine.query().get_user_stats(&user_id).await?))
}

/// GET /api/users/:id/badges
pub async fn user_badges(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<BadgeProgress>>> {
    Ok(Json(state.engine.query().get_user_badges(&user_id).await?))
}

/// GET /api/users/:id/missions
pub async fn user_missions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<MissionProgress>>> {
    Ok(Json(state.engine.query().get_user_missions(&user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// GET /api/users/:id/history?limit=
pub async fn user_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<PointEvent>>> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY);
    Ok(Json(
        state.engine.query().get_point_history(&user_id, limit).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardParams {
    pub scope: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /api/leaderboard?scope=&limit=&offset=
pub async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LeaderboardParams>,
) -> ApiResult<Json<LeaderboardPage>> {
    let scope = match params.scope.as_deref() {
        Some(raw) => raw.parse::<LeaderboardScope>()?,
        None => LeaderboardScope::default(),
    };
    let page = state
        .engine
        .query()
        .get_leaderboard(
            scope,
            params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            params.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(page))
}

/// GET /api/levels
pub async fn levels(State(state): State<Arc<AppState>>) -> Json<Vec<Level>> {
    Json(state.engine.query().get_levels())
}
