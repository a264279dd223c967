//! API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::ApiServerConfig;
use crate::error::{EgressError, Result};
use crate::service::EgressService;

use super::middleware::cors_layer;
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EgressService>,
    pub started_at: Instant,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, service: Arc<EgressService>) -> Self {
        Self {
            config,
            state: AppState {
                service,
                started_at: Instant::now(),
            },
        }
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(cors_layer(&self.config.cors_origins))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| EgressError::InvalidConfig(format!("Invalid API server address: {}", e)))?;

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| EgressError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
