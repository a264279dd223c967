use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, instrument};

use super::{NodeCatalog, NodeTester};

/// Background task keeping the ready queue at its target
pub struct Replenisher {
    catalog: Arc<NodeCatalog>,
    tester: Arc<dyn NodeTester>,
}

impl Replenisher {
    pub fn new(catalog: Arc<NodeCatalog>, tester: Arc<dyn NodeTester>) -> Self {
        Self { catalog, tester }
    }

    /// Run passes after the initial delay, then whenever a node is taken
    /// or the idle interval elapses, until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.catalog.config().clone();
        info!(
            ready_target = self.catalog.target(),
            initial_delay = ?config.initial_delay,
            "Starting hot-standby replenisher"
        );

        tokio::select! {
            _ = sleep(config.initial_delay) => {}
            _ = shutdown.changed() => {
                info!("Replenisher shutting down");
                return;
            }
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.catalog.replenish(self.tester.as_ref(), &shutdown).await;

            tokio::select! {
                _ = self.catalog.replenish_requested() => {}
                _ = sleep(config.replenish_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Replenisher shutting down");
    }
}
