//! Exit status and operator actions

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::api::server::AppState;
use crate::error::EgressError;

/// List every exit, direct first
pub async fn list_exits(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.exits())
}

/// Detect the egress IP of all exits now
pub async fn detect_ips(State(state): State<AppState>) -> impl IntoResponse {
    let found = state.service.detect_ips().await;
    info!(found, "Egress IP detection triggered via API");
    Json(json!({
        "detected": found,
        "exits": state.service.exits(),
    }))
}

/// Rebind a tunnel exit to the next node from the pool
pub async fn rebuild_exit(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<impl IntoResponse, EgressError> {
    info!(index, "Exit rebuild requested via API");
    state.service.rebuild_exit(index).await?;

    let exit = state
        .service
        .dispatcher()
        .get(index)
        .ok_or(EgressError::ExitNotFound { index })?;
    Ok(Json(exit.status()))
}
