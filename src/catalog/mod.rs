//! Node catalog and hot-standby pool
//!
//! Keeps the candidate nodes with their latest test score and a queue of
//! freshly verified nodes ready to be bound to a tunnel exit. Tiers:
//! T1 verified within the TTL, T2 untested or stale, T3 failed within the TTL.

mod replenish;
mod tester;

pub use replenish::Replenisher;
pub use tester::{NodeTester, TestOutcome, TunnelNodeTester};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::CatalogConfig;
use crate::error::Result;
use crate::models::{CatalogSummary, Node, NodeScore, NodeStatus, NodeTier};

#[derive(Debug, Default)]
struct NodeSet {
    order: Vec<String>,
    by_key: HashMap<String, Node>,
}

impl NodeSet {
    fn new(nodes: Vec<Node>) -> Self {
        let mut set = Self::default();
        for node in nodes {
            let key = node.key();
            if set.by_key.contains_key(&key) {
                continue;
            }
            set.order.push(key.clone());
            set.by_key.insert(key, node);
        }
        set
    }
}

/// What one replenishment pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplenishReport {
    pub shortage: usize,
    pub from_verified: usize,
    pub tested_untested: usize,
    pub tested_failed: usize,
    pub added: usize,
}

/// Scored candidate nodes plus the ready queue
pub struct NodeCatalog {
    nodes: RwLock<NodeSet>,
    scores: DashMap<String, NodeScore>,
    ready: Mutex<VecDeque<String>>,
    bound: Mutex<HashSet<String>>,
    cursor: AtomicUsize,
    target: usize,
    config: CatalogConfig,
    wake: Notify,
}

/// Drop unusable entries: informational banners, invalid parameters, duplicates
pub fn ingest(nodes: Vec<Node>) -> Vec<Node> {
    let total = nodes.len();
    let mut seen = HashSet::new();
    let mut informational = 0usize;
    let mut invalid = 0usize;

    let accepted: Vec<Node> = nodes
        .into_iter()
        .filter(|node| {
            if node.is_informational() {
                informational += 1;
                return false;
            }
            if let Err(e) = node.validate() {
                debug!("Skipping node: {}", e);
                invalid += 1;
                return false;
            }
            seen.insert(node.key())
        })
        .collect();

    let duplicates = total - accepted.len() - informational - invalid;
    info!(
        accepted = accepted.len(),
        informational, invalid, duplicates, "Node catalog ingested"
    );
    accepted
}

/// Read a JSON array of nodes from `path`
pub async fn load_nodes(path: &Path) -> Result<Vec<Node>> {
    let raw = tokio::fs::read(path).await?;
    let nodes: Vec<Node> = serde_json::from_slice(&raw)?;
    debug!(path = %path.display(), count = nodes.len(), "Loaded node file");
    Ok(nodes)
}

impl NodeCatalog {
    /// Build a catalog; `target` is the ready-queue length to maintain
    pub fn new(nodes: Vec<Node>, config: CatalogConfig, target: usize) -> Self {
        Self {
            nodes: RwLock::new(NodeSet::new(ingest(nodes))),
            scores: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            bound: Mutex::new(HashSet::new()),
            cursor: AtomicUsize::new(0),
            target,
            config,
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Replace the node list. Scores of surviving keys are kept.
    pub fn reload(&self, nodes: Vec<Node>) -> usize {
        let set = NodeSet::new(ingest(nodes));
        let count = set.order.len();
        self.scores.retain(|key, _| set.by_key.contains_key(key));
        self.ready.lock().retain(|key| set.by_key.contains_key(key));
        *self.nodes.write() = set;
        self.cursor.store(0, Ordering::Release);
        self.request_replenish();
        info!(nodes = count, "Node catalog reloaded");
        count
    }

    pub fn len(&self) -> usize {
        self.nodes.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, key: &str) -> Option<Node> {
        self.nodes.read().by_key.get(key).cloned()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Wake the replenisher early
    pub fn request_replenish(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn replenish_requested(&self) {
        self.wake.notified().await
    }

    pub fn score(&self, key: &str) -> Option<NodeScore> {
        self.scores.get(key).map(|s| s.clone())
    }

    pub fn tier(&self, key: &str) -> NodeTier {
        self.tier_at(key, Instant::now())
    }

    fn tier_at(&self, key: &str, now: Instant) -> NodeTier {
        self.scores
            .get(key)
            .map(|s| s.tier(now, self.config.verification_ttl))
            .unwrap_or(NodeTier::Untested)
    }

    fn sort_latency(&self, key: &str) -> f64 {
        self.scores
            .get(key)
            .map(|s| s.sort_latency())
            .unwrap_or(f64::MAX)
    }

    /// Record a test or probe result for `key`
    pub fn record_test(&self, key: &str, ok: bool, latency: Option<Duration>) {
        let now = Instant::now();
        let mut entry = self.scores.entry(key.to_string()).or_insert_with(|| NodeScore {
            verified: false,
            tested_at: now,
            tested_at_wall: Utc::now(),
            latency_ms: None,
            fail_count: 0,
        });
        entry.tested_at = now;
        entry.tested_at_wall = Utc::now();
        if ok {
            entry.verified = true;
            entry.fail_count = 0;
            entry.latency_ms = latency.map(|l| l.as_secs_f64() * 1000.0);
        } else {
            entry.verified = false;
            entry.fail_count += 1;
            entry.latency_ms = None;
        }
        drop(entry);

        if !ok {
            self.ready.lock().retain(|k| k != key);
        }
    }

    /// Mark a node as serving an exit
    pub fn mark_bound(&self, key: &str) {
        self.bound.lock().insert(key.to_string());
        self.ready.lock().retain(|k| k != key);
    }

    pub fn release(&self, key: &str) {
        self.bound.lock().remove(key);
    }

    pub fn is_bound(&self, key: &str) -> bool {
        self.bound.lock().contains(key)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn ready_keys(&self) -> Vec<String> {
        self.ready.lock().iter().cloned().collect()
    }

    pub fn shortage(&self) -> usize {
        self.target().saturating_sub(self.ready_len())
    }

    /// Drop ready entries that are no longer fresh, verified, known and free
    pub fn prune_ready(&self) -> usize {
        let now = Instant::now();
        let bound = self.bound.lock().clone();
        let nodes = self.nodes.read();
        let mut ready = self.ready.lock();
        let before = ready.len();
        ready.retain(|key| {
            nodes.by_key.contains_key(key)
                && !bound.contains(key)
                && self.tier_at(key, now) == NodeTier::Verified
        });
        let removed = before - ready.len();
        if removed > 0 {
            debug!(removed, "Pruned ready queue");
        }
        removed
    }

    /// Append verified nodes to the ready queue, then keep it sorted by latency
    fn push_ready(&self, keys: impl IntoIterator<Item = String>) -> usize {
        let now = Instant::now();
        let target = self.target();
        let bound = self.bound.lock().clone();
        let mut ready = self.ready.lock();
        let mut added = 0;

        for key in keys {
            if ready.len() >= target {
                break;
            }
            if ready.contains(&key)
                || bound.contains(&key)
                || self.tier_at(&key, now) != NodeTier::Verified
            {
                continue;
            }
            ready.push_back(key);
            added += 1;
        }

        let mut sorted: Vec<String> = ready.drain(..).collect();
        sorted.sort_by(|a, b| self.sort_latency(a).total_cmp(&self.sort_latency(b)));
        ready.extend(sorted);
        added
    }

    /// Take the next ready node, or `None` when the queue is empty
    pub fn take_ready(&self) -> Option<Node> {
        self.prune_ready();
        loop {
            let key = self.ready.lock().pop_front()?;
            if let Some(node) = self.node(&key) {
                self.request_replenish();
                return Some(node);
            }
        }
    }

    /// Next node for an exit rebuild: the ready queue first, then a
    /// round-robin scan of the whole catalog regardless of tier.
    pub fn next_node(&self) -> Option<Node> {
        if let Some(node) = self.take_ready() {
            return Some(node);
        }

        let nodes = self.nodes.read();
        let len = nodes.order.len();
        if len == 0 {
            return None;
        }
        let bound = self.bound.lock().clone();
        for _ in 0..len {
            let i = self.cursor.fetch_add(1, Ordering::AcqRel) % len;
            let key = &nodes.order[i];
            if !bound.contains(key) {
                return nodes.by_key.get(key).cloned();
            }
        }
        None
    }

    /// [`next_node`](Self::next_node) and mark the result bound in one step,
    /// so concurrent rebuilds never receive the same node.
    pub fn claim_next(&self) -> Option<Node> {
        loop {
            let node = self.next_node()?;
            if self.bound.lock().insert(node.key()) {
                return Some(node);
            }
        }
    }

    /// Candidates for one pass, split by tier. Ready and bound nodes are skipped.
    fn candidates(&self) -> (Vec<String>, Vec<Node>, Vec<Node>) {
        let now = Instant::now();
        let bound = self.bound.lock().clone();
        let ready: HashSet<String> = self.ready.lock().iter().cloned().collect();
        let nodes = self.nodes.read();

        let mut verified = Vec::new();
        let mut untested = Vec::new();
        let mut failed = Vec::new();
        for key in &nodes.order {
            if bound.contains(key) || ready.contains(key) {
                continue;
            }
            let Some(node) = nodes.by_key.get(key) else {
                continue;
            };
            match self.tier_at(key, now) {
                NodeTier::Verified => verified.push(key.clone()),
                NodeTier::Untested => untested.push(node.clone()),
                NodeTier::Failed => failed.push(node.clone()),
            }
        }

        verified.sort_by(|a, b| self.sort_latency(a).total_cmp(&self.sort_latency(b)));
        failed.sort_by_key(|n| self.score(&n.key()).map(|s| s.fail_count).unwrap_or(0));
        (verified, untested, failed)
    }

    /// Fill the ready queue up to its target: verified nodes first, then
    /// tested batches of untested and finally failed nodes.
    #[instrument(skip(self, tester, shutdown))]
    pub async fn replenish(
        &self,
        tester: &dyn NodeTester,
        shutdown: &watch::Receiver<bool>,
    ) -> ReplenishReport {
        self.prune_ready();
        let mut report = ReplenishReport {
            shortage: self.shortage(),
            ..Default::default()
        };
        if report.shortage == 0 {
            return report;
        }

        let (verified, untested, failed) = self.candidates();
        report.from_verified = self.push_ready(verified);
        report.added += report.from_verified;

        let need = self.shortage();
        if need > 0 && !untested.is_empty() && !*shutdown.borrow() {
            let batch: Vec<Node> = untested
                .into_iter()
                .take(need * self.config.untested_batch_factor)
                .collect();
            report.tested_untested = batch.len();
            report.added += self.test_and_admit(tester, batch).await;
        }

        let need = self.shortage();
        if need > 0 && !failed.is_empty() && !*shutdown.borrow() {
            let batch: Vec<Node> = failed
                .into_iter()
                .take(need * self.config.failed_batch_factor)
                .collect();
            report.tested_failed = batch.len();
            report.added += self.test_and_admit(tester, batch).await;
        }

        let summary = self.summary();
        info!(
            t1 = summary.verified,
            t2 = summary.untested,
            t3 = summary.failed,
            ready = summary.ready,
            ready_target = summary.ready_target,
            added = report.added,
            "Hot-standby pool replenished"
        );
        if summary.ready < summary.ready_target {
            warn!(
                ready = summary.ready,
                ready_target = summary.ready_target,
                "Hot-standby pool below target"
            );
        }
        report
    }

    async fn test_and_admit(&self, tester: &dyn NodeTester, batch: Vec<Node>) -> usize {
        let outcomes = tester.test_batch(batch).await;
        let mut passed = Vec::new();
        for outcome in outcomes {
            self.record_test(&outcome.key, outcome.latency.is_some(), outcome.latency);
            if let Some(latency) = outcome.latency {
                passed.push((latency, outcome.key));
            }
        }
        // fastest first so the cap at target keeps the best nodes
        passed.sort_by_key(|(latency, _)| *latency);
        self.push_ready(passed.into_iter().map(|(_, key)| key))
    }

    pub fn summary(&self) -> CatalogSummary {
        let now = Instant::now();
        let nodes = self.nodes.read();
        let mut summary = CatalogSummary {
            total: nodes.order.len(),
            ready: self.ready_len(),
            ready_target: self.target(),
            in_use: self.bound.lock().len(),
            ..Default::default()
        };
        for key in &nodes.order {
            match self.tier_at(key, now) {
                NodeTier::Verified => summary.verified += 1,
                NodeTier::Untested => summary.untested += 1,
                NodeTier::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        let now = Instant::now();
        let bound = self.bound.lock().clone();
        let ready: HashSet<String> = self.ready.lock().iter().cloned().collect();
        let nodes = self.nodes.read();

        nodes
            .order
            .iter()
            .filter_map(|key| nodes.by_key.get(key).map(|n| (key, n)))
            .map(|(key, node)| {
                let score = self.score(key);
                let tier = self.tier_at(key, now);
                NodeStatus {
                    key: key.clone(),
                    name: node.label(),
                    protocol: node.protocol().to_string(),
                    tier,
                    tier_label: tier.label().to_string(),
                    latency_ms: score.as_ref().and_then(|s| s.latency_ms),
                    verified: score.as_ref().map(|s| s.verified).unwrap_or(false),
                    fail_count: score.as_ref().map(|s| s.fail_count).unwrap_or(0),
                    last_tested_at: score.as_ref().map(|s| s.tested_at_wall),
                    in_use: bound.contains(key),
                    ready: ready.contains(key),
                }
            })
            .collect()
    }
}
