//! CORS for the status API
//!
//! Read-mostly and unauthenticated, so credentials are never allowed.

use axum::http::header;
use axum::http::{HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tracing::debug;

const LOCAL_ORIGINS: &[&str] = &["http://localhost:3000", "http://127.0.0.1:3000"];

/// CORS layer for `allowed_origins`; an empty list allows local dashboards only
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = if allowed_origins.is_empty() {
        debug!("CORS: No origins specified, allowing localhost only");
        LOCAL_ORIGINS
            .iter()
            .map(|o| HeaderValue::from_static(*o))
            .collect()
    } else {
        debug!("CORS: Allowing origins: {:?}", allowed_origins);
        allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect()
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}
