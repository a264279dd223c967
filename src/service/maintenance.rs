//! In-place rebuilding of tunnel exits

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::catalog::NodeCatalog;
use crate::config::HealthConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{EgressError, Result};
use crate::exit::Exit;
use crate::health::HealthProber;
use crate::tunnel::TunnelLauncher;

/// Candidate nodes tried per rebuild before giving up
const MAX_NODE_ATTEMPTS: usize = 3;

/// Why an exit needs a new node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    Unbound,
    ProcessDied,
    ProbeFailures(u32),
    Requested,
}

/// Rebinds tunnel exits to fresh nodes, keeping each exit in its slot
pub struct ExitMaintainer {
    dispatcher: Arc<Dispatcher>,
    catalog: Arc<NodeCatalog>,
    launcher: Arc<dyn TunnelLauncher>,
    prober: Arc<HealthProber>,
    config: HealthConfig,
    // one per slot; slot 0 (direct) is never locked
    locks: Vec<Mutex<()>>,
}

impl ExitMaintainer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        catalog: Arc<NodeCatalog>,
        launcher: Arc<dyn TunnelLauncher>,
        prober: Arc<HealthProber>,
        config: HealthConfig,
    ) -> Self {
        let slots = dispatcher.exits().len();
        Self {
            dispatcher,
            catalog,
            launcher,
            prober,
            config,
            locks: (0..slots).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Whether `exit` should be rebuilt now
    pub fn needs_rebuild(&self, exit: &Exit) -> Option<RebuildReason> {
        let port = exit.port()?;
        if exit.node_key().is_none() {
            return (!self.catalog.is_empty()).then_some(RebuildReason::Unbound);
        }
        if !self.launcher.is_running(port) {
            return Some(RebuildReason::ProcessDied);
        }
        let failures = exit.probe_failures();
        (failures >= self.config.rebuild_after_failures)
            .then_some(RebuildReason::ProbeFailures(failures))
    }

    /// Run the maintenance loop (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting exit maintenance with {}s interval",
            self.config.maintenance_interval.as_secs()
        );
        let mut ticker = interval_at(
            Instant::now() + self.config.maintenance_interval,
            self.config.maintenance_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maintain_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Exit maintenance shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Rebuild every exit that needs it; returns how many were rebuilt
    pub async fn maintain_once(&self) -> usize {
        let due: Vec<(Arc<Exit>, RebuildReason)> = self
            .dispatcher
            .tunnels()
            .into_iter()
            .filter_map(|exit| self.needs_rebuild(&exit).map(|reason| (exit, reason)))
            .collect();

        let results = join_all(due.iter().map(|(exit, reason)| async move {
            // An exit already being rebuilt is left alone
            let Some(lock) = self.locks.get(exit.index()) else {
                return false;
            };
            let Ok(_held) = lock.try_lock() else {
                debug!(exit = %exit.name(), "Rebuild already in progress");
                return false;
            };
            // Re-check under the lock; a manual rebuild may have just finished
            if self.needs_rebuild(exit).is_none() {
                return false;
            }
            self.rebuild_locked(exit, *reason).await.is_ok()
        }))
        .await;

        results.into_iter().filter(|ok| *ok).count()
    }

    /// Rebuild the exit in slot `index` onto the next available node
    pub async fn rebuild_exit(&self, index: usize) -> Result<()> {
        let exit = self
            .dispatcher
            .get(index)
            .ok_or(EgressError::ExitNotFound { index })?;
        if exit.is_direct() {
            return Err(EgressError::InvalidRequest(
                "the direct exit cannot be rebuilt".into(),
            ));
        }
        let lock = self
            .locks
            .get(index)
            .ok_or(EgressError::ExitNotFound { index })?;
        let _held = lock.lock().await;
        self.rebuild_locked(&exit, RebuildReason::Requested).await
    }

    #[instrument(skip(self, exit), fields(exit = %exit.name(), port = exit.port()))]
    async fn rebuild_locked(&self, exit: &Arc<Exit>, reason: RebuildReason) -> Result<()> {
        let port = exit
            .port()
            .ok_or_else(|| EgressError::Internal("direct exit has no tunnel".into()))?;
        info!(?reason, "Rebuilding exit");

        if let Some(old) = exit.unbind() {
            self.catalog.release(&old.key());
        }
        if let Err(e) = self.launcher.stop(port).await {
            warn!("Failed to stop previous tunnel: {}", e);
            exit.record_error(format!("tunnel: {}", e));
            return Err(e);
        }

        for attempt in 1..=MAX_NODE_ATTEMPTS {
            let Some(node) = self.catalog.claim_next() else {
                warn!("No candidate node available");
                break;
            };
            let key = node.key();

            let started = match self.launcher.start(port, &node).await {
                Ok(()) => exit.bind(node.clone()),
                Err(e) => Err(e),
            };
            match started {
                Ok(()) => {
                    info!(node = %key, protocol = node.protocol(), attempt, "Exit rebuilt");
                    self.spawn_ip_detection(exit.clone());
                    return Ok(());
                }
                Err(e) => {
                    warn!(node = %key, attempt, "Failed to bring up node: {}", e);
                    exit.record_error(format!("tunnel: {}", e));
                    self.catalog.record_test(&key, false, None);
                    self.catalog.release(&key);
                    let _ = self.launcher.stop(port).await;
                }
            }
        }

        Err(EgressError::Process(format!(
            "no node could be started on port {}",
            port
        )))
    }

    fn spawn_ip_detection(&self, exit: Arc<Exit>) {
        let prober = self.prober.clone();
        tokio::spawn(async move {
            prober.detect_exit_ip(&exit).await;
        });
    }
}
