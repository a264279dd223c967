//! Egress Dispatch - Entry Point
//!
//! Starts the egress service and its status API with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use egress_dispatch::api::ApiServer;
use egress_dispatch::catalog::load_nodes;
use egress_dispatch::config::LogConfig;
use egress_dispatch::{Config, EgressService, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Egress Dispatch");

    let nodes = match &config.catalog.nodes_file {
        Some(path) => {
            let nodes = load_nodes(path).await?;
            info!("Loaded {} candidate nodes from {}", nodes.len(), path.display());
            nodes
        }
        None => {
            warn!("EGRESS_NODES_FILE not set; only the direct exit will be usable");
            Vec::new()
        }
    };

    let service = Arc::new(EgressService::new(config.clone(), nodes)?);
    service.start().await?;

    let (shutdown_tx, _) = watch::channel(false);
    let api_server = ApiServer::new(config.api.clone(), service.clone());
    let api_shutdown = shutdown_tx.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!(
        "Egress service running - {}, API: {}",
        service.status().dispatcher.summary,
        config.api_addr()
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    service.stop().await;
    let _ = api_task.await;

    info!("Egress Dispatch stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("egress_dispatch={},tower_http=info", log.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
