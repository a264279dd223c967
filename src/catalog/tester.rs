//! Node testing through throwaway tunnels on dedicated test ports

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::health::probe_once;
use crate::models::Node;
use crate::tunnel::TunnelLauncher;

/// Result of testing one node: `latency` is `None` when the node failed
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub key: String,
    pub latency: Option<Duration>,
}

/// Tests candidate nodes outside the serving exits
#[async_trait]
pub trait NodeTester: Send + Sync {
    /// One outcome per input node, in any order
    async fn test_batch(&self, nodes: Vec<Node>) -> Vec<TestOutcome>;
}

/// Starts each candidate on a free test port, probes it, then stops it.
/// At most one tunnel runs per test port.
pub struct TunnelNodeTester {
    launcher: Arc<dyn TunnelLauncher>,
    free_ports: Mutex<Vec<u16>>,
    slots: usize,
    probe_url: String,
    timeout: Duration,
}

impl TunnelNodeTester {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        base_port: u16,
        slots: usize,
        probe_url: String,
        timeout: Duration,
    ) -> Self {
        // ports past 65535 are dropped rather than wrapped
        let mut ports: Vec<u16> = (0..slots.max(1))
            .map_while(|i| u16::try_from(i).ok().and_then(|i| base_port.checked_add(i)))
            .collect();
        ports.reverse();
        if ports.len() < slots {
            warn!(base_port, slots, usable = ports.len(), "Test port range truncated");
        }
        Self {
            launcher,
            slots: ports.len().max(1),
            free_ports: Mutex::new(ports),
            probe_url,
            timeout,
        }
    }

    async fn test_one(&self, node: Node) -> TestOutcome {
        let key = node.key();
        let Some(port) = self.free_ports.lock().pop() else {
            warn!(node = %key, "No free test port");
            return TestOutcome { key, latency: None };
        };

        let latency = match self.launcher.start(port, &node).await {
            Ok(()) => match probe_once(Some(port), &self.probe_url, self.timeout).await {
                Ok(latency) => Some(latency),
                Err(e) => {
                    debug!(node = %key, port, "Node test probe failed: {}", e);
                    None
                }
            },
            Err(e) => {
                debug!(node = %key, port, "Node test tunnel failed: {}", e);
                None
            }
        };

        if let Err(e) = self.launcher.stop(port).await {
            warn!(port, "Failed to release test port: {}", e);
        }
        self.free_ports.lock().push(port);

        TestOutcome { key, latency }
    }
}

#[async_trait]
impl NodeTester for TunnelNodeTester {
    async fn test_batch(&self, nodes: Vec<Node>) -> Vec<TestOutcome> {
        stream::iter(nodes)
            .map(|node| self.test_one(node))
            .buffer_unordered(self.slots)
            .collect()
            .await
    }
}
