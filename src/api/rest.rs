// =============================================================================
// ControlPlane — operator HTTP surface (Axum 0.7)
// =============================================================================
//
// All responses are JSON except the Prometheus scrape. `/ready` is the
// deployment's readiness contract: 200 iff this instance holds the leader
// lock and all three heartbeats are fresh, 503 with the failing gauges
// otherwise. `/mode` LIVE is refused without the literal confirmation
// phrase; `/flatten` always accepts and returns per-position outcomes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::orchestrator::{ModeError, Orchestrator};
use crate::supervisor::ScanSupervisor;
use crate::types::TradingMode;

/// Everything the handlers need, cloned per request.
#[derive(Clone)]
pub struct ApiContext {
    pub app: Arc<AppState>,
    pub orchestrator: Arc<Orchestrator>,
    pub supervisor: Arc<ScanSupervisor>,
    pub metrics: PrometheusHandle,
}

/// Build the control-plane router with CORS and shared context.
pub fn router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/state", get(state))
        .route("/positions", get(positions))
        .route("/orders", get(orders))
        .route("/risk", get(risk))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/flatten", post(flatten))
        .route("/mode", post(mode))
        .route("/metrics", get(metrics_scrape))
        .route("/debug/supervisor/status", get(supervisor_status))
        .route("/debug/supervisor/start", post(supervisor_start))
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Liveness & readiness
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready(State(ctx): State<ApiContext>) -> impl IntoResponse {
    match ctx.app.readiness() {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready" })),
        ),
        Err(reasons) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "reasons": reasons })),
        ),
    }
}

// =============================================================================
// Snapshots
// =============================================================================

async fn state(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.orchestrator.state_snapshot())
}

async fn positions(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let positions = ctx.app.store.open_positions().unwrap_or_default();
    Json(positions)
}

async fn orders(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let orders = ctx.app.store.open_orders().unwrap_or_default();
    Json(orders)
}

async fn risk(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let coord = ctx.app.coordinator_snapshot();
    let events = ctx.app.store.recent_risk_events(50).unwrap_or_default();
    Json(serde_json::json!({
        "portfolio_heat": coord.portfolio_heat,
        "daily_realized_pnl": coord.daily_realized_pnl,
        "paused": coord.paused,
        "pause_reason": coord.pause_reason,
        "capital": ctx.app.config.capital,
        "per_trade_risk_pct": ctx.app.config.per_trade_risk_pct,
        "max_portfolio_heat_pct": ctx.app.config.max_portfolio_heat_pct,
        "daily_loss_stop_pct": ctx.app.config.daily_loss_stop_pct,
        "recent_events": events,
    }))
}

// =============================================================================
// Controls
// =============================================================================

async fn pause(State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.orchestrator.pause("operator").await;
    info!("trading paused via API");
    Json(serde_json::json!({ "status": "paused" }))
}

async fn resume(State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.orchestrator.resume().await;
    info!("trading resumed via API");
    Json(serde_json::json!({ "status": "running" }))
}

#[derive(Deserialize)]
struct FlattenRequest {
    #[serde(default = "default_flatten_reason")]
    reason: String,
}

fn default_flatten_reason() -> String {
    "manual".to_string()
}

async fn flatten(
    State(ctx): State<ApiContext>,
    Json(req): Json<FlattenRequest>,
) -> impl IntoResponse {
    info!(reason = %req.reason, "flatten requested via API");
    let summary = ctx.orchestrator.flatten(&req.reason).await;
    Json(summary)
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: String,
    #[serde(default)]
    confirm: Option<String>,
}

#[derive(Serialize)]
struct ModeResponse {
    mode: String,
}

async fn mode(
    State(ctx): State<ApiContext>,
    Json(req): Json<ModeRequest>,
) -> Result<Json<ModeResponse>, (StatusCode, Json<serde_json::Value>)> {
    let target: TradingMode = req.mode.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("invalid mode '{}': use PAPER or LIVE", req.mode),
            })),
        )
    })?;

    match ctx.orchestrator.set_mode(target, req.confirm.as_deref()).await {
        Ok(mode) => Ok(Json(ModeResponse { mode: mode.to_string() })),
        Err(e @ ModeError::ConfirmationRequired) => Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
        Err(ModeError::Refused(reason)) => Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": reason })),
        )),
    }
}

// =============================================================================
// Metrics & debug
// =============================================================================

async fn metrics_scrape(State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.metrics.render()
}

async fn supervisor_status(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.supervisor.status())
}

async fn supervisor_start(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let started = ctx.supervisor.start();
    if started {
        ctx.orchestrator.audit(
            crate::store::models::AuditAction::SupervisorRestart,
            serde_json::json!({ "via": "api" }),
        );
    }
    Json(serde_json::json!({
        "started": started,
        "status": ctx.supervisor.status(),
    }))
}
