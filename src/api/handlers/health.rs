//! Liveness and combined status

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "egress-dispatch"
        })),
    )
}

/// Dispatcher summary, per-exit status and catalog summary
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.service.status();
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "running": state.service.is_running(),
        "started_at": status.started_at,
        "summary": status.dispatcher.summary.clone(),
        "dispatcher": status.dispatcher,
        "catalog": status.catalog,
        "exits": status.exits,
    }))
}
