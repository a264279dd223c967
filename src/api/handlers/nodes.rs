//! Node catalog view

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;

/// Catalog summary plus every node with its tier and score
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = state.service.catalog();
    Json(json!({
        "summary": catalog.summary(),
        "ready": catalog.ready_keys(),
        "nodes": catalog.statuses(),
    }))
}
