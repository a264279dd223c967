//! The egress service context
//!
//! Owns the exits, the dispatcher, the node catalog and every background loop.
//! Constructed once, started with [`EgressService::start`] and torn down with
//! [`EgressService::stop`].

mod maintenance;

pub use maintenance::{ExitMaintainer, RebuildReason};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::catalog::{NodeCatalog, NodeTester, Replenisher, TunnelNodeTester};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::exit::Exit;
use crate::forward::ForwardExecutor;
use crate::health::{ExitProbe, HealthProber, HttpProbe};
use crate::models::{
    CatalogSummary, DispatcherSummary, ExitStatus, ForwardResponse, Node, NodeStatus,
    OutboundRequest,
};
use crate::tunnel::{TunnelLauncher, TunnelManager};

/// Delay between start and the first egress IP detection
const INITIAL_IP_DETECT_DELAY: Duration = Duration::from_secs(2);

/// Combined status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub started_at: Option<DateTime<Utc>>,
    pub dispatcher: DispatcherSummary,
    pub catalog: CatalogSummary,
    pub exits: Vec<ExitStatus>,
}

/// Pluggable collaborators; defaults talk to real tunnels and the network
pub struct Components {
    pub launcher: Arc<dyn TunnelLauncher>,
    pub probe: Arc<dyn ExitProbe>,
    pub tester: Arc<dyn NodeTester>,
}

impl Components {
    pub fn from_config(config: &Config) -> Result<Self> {
        let launcher: Arc<dyn TunnelLauncher> = Arc::new(TunnelManager::new(config.tunnel.clone()));
        let tester = TunnelNodeTester::new(
            launcher.clone(),
            config.test_port_base()?,
            config.catalog.test_slots,
            config.health.probe_url.clone(),
            config.health.timeout,
        );
        Ok(Self {
            probe: Arc::new(HttpProbe::new(&config.health)),
            tester: Arc::new(tester),
            launcher,
        })
    }
}

pub struct EgressService {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    catalog: Arc<NodeCatalog>,
    launcher: Arc<dyn TunnelLauncher>,
    tester: Arc<dyn NodeTester>,
    prober: Arc<HealthProber>,
    maintainer: Arc<ExitMaintainer>,
    executor: ForwardExecutor,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl EgressService {
    /// Build the service with real tunnels and network probes
    pub fn new(config: Config, nodes: Vec<Node>) -> Result<Self> {
        config.validate()?;
        let components = Components::from_config(&config)?;
        Self::with_components(config, nodes, components)
    }

    pub fn with_components(config: Config, nodes: Vec<Node>, components: Components) -> Result<Self> {
        let mut exits = Vec::with_capacity(config.tunnel.exits + 1);
        exits.push(Arc::new(Exit::direct(&config.dispatch)?));
        for slot in 1..=config.tunnel.exits {
            exits.push(Arc::new(Exit::tunnel(
                slot,
                config.tunnel.exit_port(slot)?,
                &config.dispatch,
            )?));
        }
        let dispatcher = Arc::new(Dispatcher::new(exits)?);

        let catalog = Arc::new(NodeCatalog::new(
            nodes,
            config.catalog.clone(),
            config.tunnel.exits,
        ));

        let prober = Arc::new(
            HealthProber::new(dispatcher.clone(), components.probe, config.health.clone())
                .with_catalog(catalog.clone()),
        );
        let maintainer = Arc::new(ExitMaintainer::new(
            dispatcher.clone(),
            catalog.clone(),
            components.launcher.clone(),
            prober.clone(),
            config.health.clone(),
        ));
        let executor = ForwardExecutor::new(dispatcher.clone(), config.dispatch.clone())
            .with_catalog(catalog.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            dispatcher,
            catalog,
            launcher: components.launcher,
            tester: components.tester,
            prober,
            maintainer,
            executor,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            started_at: Mutex::new(None),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn catalog(&self) -> &Arc<NodeCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !*self.shutdown_tx.borrow()
    }

    /// Bind every tunnel exit and spawn the background loops. Exits that
    /// cannot be brought up stay unhealthy and are retried by maintenance.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Egress service already started");
            return Ok(());
        }
        *self.started_at.lock() = Some(Utc::now());
        info!(
            exits = self.config.tunnel.exits,
            nodes = self.catalog.len(),
            "Starting egress service"
        );

        let tunnels = self.dispatcher.tunnels();
        let results = join_all(
            tunnels
                .iter()
                .map(|exit| self.maintainer.rebuild_exit(exit.index())),
        )
        .await;
        let bound = results.iter().filter(|r| r.is_ok()).count();
        for (exit, result) in tunnels.iter().zip(&results) {
            if let Err(e) = result {
                warn!(exit = %exit.name(), "Exit not bound at startup: {}", e);
            }
        }
        info!(bound, total = tunnels.len(), "Tunnel exits bound");

        let mut tasks = Vec::new();

        let prober = self.prober.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { prober.run(shutdown).await }));

        let replenisher = Replenisher::new(self.catalog.clone(), self.tester.clone());
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { replenisher.run(shutdown).await }));

        let maintainer = self.maintainer.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { maintainer.run(shutdown).await }));

        let prober = self.prober.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = sleep(INITIAL_IP_DETECT_DELAY) => {
                    let found = prober.detect_all_ips().await;
                    info!(found, "Initial egress IP detection complete");
                }
                _ = shutdown.changed() => {}
            }
        }));

        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Forward a request through the exit picked for its class
    pub async fn forward(&self, request: OutboundRequest) -> Result<ForwardResponse> {
        self.executor.execute(&request).await
    }

    /// Force the tunnel exit in slot `index` onto a new node
    pub async fn rebuild_exit(&self, index: usize) -> Result<()> {
        self.maintainer.rebuild_exit(index).await
    }

    /// Detect the egress IP of every exit now; returns how many answered
    pub async fn detect_ips(&self) -> usize {
        self.prober.detect_all_ips().await
    }

    /// Replace the candidate node list
    pub fn reload(&self, nodes: Vec<Node>) -> usize {
        self.catalog.reload(nodes)
    }

    pub fn exits(&self) -> Vec<ExitStatus> {
        self.dispatcher.statuses()
    }

    pub fn nodes(&self) -> Vec<NodeStatus> {
        self.catalog.statuses()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            started_at: *self.started_at.lock(),
            dispatcher: self.dispatcher.summary(),
            catalog: self.catalog.summary(),
            exits: self.dispatcher.statuses(),
        }
    }

    /// Stop the background loops, then every tunnel process
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        if !self.started.load(Ordering::Acquire) || self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Stopping egress service");

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Background task failed: {}", e);
            }
        }

        self.launcher.stop_all().await;
        for exit in self.dispatcher.tunnels() {
            if let Some(node) = exit.unbind() {
                self.catalog.release(&node.key());
            }
        }
        info!("Egress service stopped");
    }
}
