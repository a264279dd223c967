//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/status", get(handlers::health::status))
        .route("/api/exits", get(handlers::exits::list_exits))
        .route("/api/exits/detect-ip", post(handlers::exits::detect_ips))
        .route("/api/exits/:index/rebuild", post(handlers::exits::rebuild_exit))
        .route("/api/nodes", get(handlers::nodes::list_nodes))
        .with_state(state)
}
