//! Egress path state
//!
//! An [`Exit`] is either the direct connection (always slot 0) or a tunnel
//! exit bound to a local SOCKS port served by a tunnel process. Rate and
//! login accounting sit behind a per-exit mutex; everything else is atomic.

mod window;

pub use window::SlidingWindow;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::error::{EgressError, Result};
use crate::models::{ExitCounters, ExitKind, ExitStatus, LoginCooldown, Node};

const RECENT_ERRORS: usize = 10;

/// Reaction to an alert status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAlert {
    None,
    /// 403: frozen and throttled
    Blocked,
    /// 429: throttled
    RateLimited,
    /// 503: counted only
    Unavailable,
}

#[derive(Debug)]
struct ExitLimits {
    requests: SlidingWindow,
    logins: SlidingWindow,
    login_inflight: usize,
    /// Requests per window, 0 = unbounded
    rate_limit: u32,
    frozen_until: Option<Instant>,
}

impl ExitLimits {
    fn new(window: Duration) -> Self {
        Self {
            requests: SlidingWindow::new(window),
            logins: SlidingWindow::new(window),
            login_inflight: 0,
            rate_limit: 0,
            frozen_until: None,
        }
    }

    fn is_frozen(&self, now: Instant) -> bool {
        self.frozen_until.map_or(false, |until| now < until)
    }

    fn login_load(&mut self, now: Instant) -> usize {
        self.logins.count(now) + self.login_inflight
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    logins: AtomicU64,
    logins_over_quota: AtomicU64,
    errors: AtomicU64,
    warn_403: AtomicU64,
    warn_429: AtomicU64,
    warn_503: AtomicU64,
}

/// One egress path
#[derive(Debug)]
pub struct Exit {
    index: usize,
    kind: ExitKind,
    port: Option<u16>,
    name: RwLock<String>,
    node: RwLock<Option<Node>>,
    healthy: AtomicBool,
    active: AtomicUsize,
    limits: Mutex<ExitLimits>,
    counters: Counters,
    exit_ip: RwLock<Option<IpAddr>>,
    recent_errors: Mutex<VecDeque<String>>,
    probe_failures: AtomicU32,
    client: RwLock<reqwest::Client>,
    policy: DispatchConfig,
}

impl Exit {
    /// The direct exit, slot 0
    pub fn direct(policy: &DispatchConfig) -> Result<Self> {
        let client = build_client(None, policy)?;
        Ok(Self::with_client(0, ExitKind::Direct, None, "direct", client, policy, true))
    }

    /// An unbound tunnel exit on a fixed local port
    pub fn tunnel(index: usize, port: u16, policy: &DispatchConfig) -> Result<Self> {
        let client = build_client(Some(port), policy)?;
        Ok(Self::with_client(
            index,
            ExitKind::Tunnel,
            Some(port),
            &format!("tunnel-{}", index),
            client,
            policy,
            false,
        ))
    }

    fn with_client(
        index: usize,
        kind: ExitKind,
        port: Option<u16>,
        name: &str,
        client: reqwest::Client,
        policy: &DispatchConfig,
        healthy: bool,
    ) -> Self {
        Self {
            index,
            kind,
            port,
            name: RwLock::new(name.to_string()),
            node: RwLock::new(None),
            healthy: AtomicBool::new(healthy),
            active: AtomicUsize::new(0),
            limits: Mutex::new(ExitLimits::new(policy.window)),
            counters: Counters::default(),
            exit_ip: RwLock::new(None),
            recent_errors: Mutex::new(VecDeque::with_capacity(RECENT_ERRORS)),
            probe_failures: AtomicU32::new(0),
            client: RwLock::new(client),
            policy: policy.clone(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> ExitKind {
        self.kind
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ExitKind::Direct
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn node(&self) -> Option<Node> {
        self.node.read().clone()
    }

    pub fn node_key(&self) -> Option<String> {
        self.node.read().as_ref().map(Node::key)
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.read().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_frozen(&self) -> bool {
        self.limits.lock().is_frozen(Instant::now())
    }

    /// Healthy and not frozen
    pub fn is_available(&self) -> bool {
        self.is_healthy() && !self.is_frozen()
    }

    pub fn rate_limit(&self) -> u32 {
        self.limits.lock().rate_limit
    }

    pub fn exit_ip(&self) -> Option<IpAddr> {
        *self.exit_ip.read()
    }

    pub fn counters(&self) -> ExitCounters {
        ExitCounters {
            total_requests: self.counters.total.load(Ordering::Relaxed),
            login_requests: self.counters.logins.load(Ordering::Relaxed),
            login_over_quota: self.counters.logins_over_quota.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            warn_403: self.counters.warn_403.load(Ordering::Relaxed),
            warn_429: self.counters.warn_429.load(Ordering::Relaxed),
            warn_503: self.counters.warn_503.load(Ordering::Relaxed),
        }
    }

    /// Count this exit as busy until the guard drops
    pub fn acquire(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveGuard { exit: self.clone() }
    }

    /// Acquire only if `active` still equals the value the caller selected on
    pub fn try_acquire(self: &Arc<Self>, observed: usize) -> Option<ActiveGuard> {
        self.active
            .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActiveGuard { exit: self.clone() })
    }

    /// Confirmed plus in-flight logins in the trailing window
    pub fn login_load(&self) -> usize {
        self.limits.lock().login_load(Instant::now())
    }

    /// Reserve one login if the quota allows it
    pub fn try_reserve_login(self: &Arc<Self>) -> Option<LoginReservation> {
        let mut limits = self.limits.lock();
        if limits.login_load(Instant::now()) >= self.policy.login_quota {
            return None;
        }
        limits.login_inflight += 1;
        drop(limits);
        Some(LoginReservation::new(self.clone()))
    }

    /// Count a login that went out without a reservation. It stays out of
    /// the login window so the confirmed count never passes the quota.
    pub fn record_login_over_quota(&self) {
        self.counters.logins.fetch_add(1, Ordering::Relaxed);
        self.counters.logins_over_quota.fetch_add(1, Ordering::Relaxed);
    }

    /// Time until one more login fits in the quota
    pub fn login_available_in(&self) -> Duration {
        let mut limits = self.limits.lock();
        let now = Instant::now();
        let quota = self.policy.login_quota;
        if limits.login_inflight >= quota {
            return limits.logins.span();
        }
        let allowed = quota - limits.login_inflight;
        limits.logins.wait_for_capacity(now, allowed)
    }

    /// Record a request, waiting first while the exit is throttled.
    ///
    /// Cancelling the returned future leaves no trace in the window.
    pub async fn admit_request(&self) {
        loop {
            let wait = {
                let mut limits = self.limits.lock();
                let now = Instant::now();
                let limit = limits.rate_limit as usize;
                let wait = if limit == 0 {
                    Duration::ZERO
                } else {
                    limits.requests.wait_for_capacity(now, limit)
                };
                if wait.is_zero() {
                    limits.requests.push(now);
                    None
                } else {
                    Some(wait)
                }
            };

            match wait {
                None => break,
                Some(wait) => {
                    debug!(exit = %self.name(), wait_ms = wait.as_millis() as u64, "Waiting for rate slot");
                    tokio::time::sleep(wait.max(Duration::from_millis(5))).await;
                }
            }
        }
        self.counters.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests recorded in the trailing window
    pub fn requests_in_window(&self) -> usize {
        self.limits.lock().requests.count(Instant::now())
    }

    /// Update counters and limits for an upstream status code
    pub fn record_status(&self, status: u16) -> StatusAlert {
        match status {
            403 => {
                self.counters.warn_403.fetch_add(1, Ordering::Relaxed);
                self.freeze();
                self.throttle();
                StatusAlert::Blocked
            }
            429 => {
                self.counters.warn_429.fetch_add(1, Ordering::Relaxed);
                self.throttle();
                StatusAlert::RateLimited
            }
            503 => {
                self.counters.warn_503.fetch_add(1, Ordering::Relaxed);
                StatusAlert::Unavailable
            }
            _ => StatusAlert::None,
        }
    }

    /// Exclude the exit from selection for the freeze duration. No-op on direct.
    pub fn freeze(&self) -> bool {
        if self.is_direct() {
            return false;
        }
        let until = Instant::now() + self.policy.freeze_duration;
        self.limits.lock().frozen_until = Some(until);
        warn!(
            exit = %self.name(),
            secs = self.policy.freeze_duration.as_secs(),
            "Exit frozen after block"
        );
        true
    }

    pub fn freeze_remaining(&self) -> Duration {
        let limits = self.limits.lock();
        limits
            .frozen_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Lower the rate limit. No-op on direct.
    pub fn throttle(&self) -> Option<u32> {
        if self.is_direct() {
            return None;
        }
        let policy = &self.policy;
        let mut limits = self.limits.lock();
        let now = Instant::now();
        let new_limit = if limits.rate_limit == 0 {
            let observed = limits.requests.count(now) as f64;
            (observed * policy.throttle_ratio).floor() as u32
        } else {
            (limits.rate_limit as f64 * policy.throttle_step).floor() as u32
        }
        .max(policy.throttle_floor);
        let previous = limits.rate_limit;
        limits.rate_limit = new_limit;
        drop(limits);

        warn!(
            exit = %self.name(),
            previous,
            limit = new_limit,
            "Exit throttled"
        );
        Some(new_limit)
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent_errors.lock();
        if recent.len() == RECENT_ERRORS {
            recent.pop_front();
        }
        recent.push_back(message.into());
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.recent_errors.lock().iter().cloned().collect()
    }

    pub fn mark_healthy(&self) -> bool {
        self.probe_failures.store(0, Ordering::Release);
        !self.healthy.swap(true, Ordering::AcqRel)
    }

    /// Returns the consecutive failure count. Direct stays healthy.
    pub fn mark_unhealthy(&self) -> u32 {
        if self.is_direct() {
            return 0;
        }
        self.healthy.store(false, Ordering::Release);
        self.probe_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn probe_failures(&self) -> u32 {
        self.probe_failures.load(Ordering::Acquire)
    }

    /// Store a newly detected egress IP; returns whether it changed
    pub fn set_exit_ip(&self, ip: IpAddr) -> bool {
        let mut current = self.exit_ip.write();
        if *current == Some(ip) {
            return false;
        }
        *current = Some(ip);
        true
    }

    /// Attach a node after its tunnel came up. Resets limits and the egress IP.
    pub fn bind(&self, node: Node) -> Result<()> {
        let port = self
            .port
            .ok_or_else(|| EgressError::Internal("cannot bind a node to the direct exit".into()))?;
        // Fresh client so pooled connections to the previous tunnel are dropped
        let client = build_client(Some(port), &self.policy)?;

        *self.name.write() = node.label();
        *self.node.write() = Some(node);
        *self.client.write() = client;
        *self.limits.lock() = ExitLimits::new(self.policy.window);
        *self.exit_ip.write() = None;
        self.probe_failures.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
        Ok(())
    }

    /// Detach the node; the exit stays in its slot as unhealthy
    pub fn unbind(&self) -> Option<Node> {
        if self.is_direct() {
            return None;
        }
        self.healthy.store(false, Ordering::Release);
        *self.name.write() = format!("tunnel-{}", self.index);
        self.node.write().take()
    }

    pub fn status(&self) -> ExitStatus {
        let now = Instant::now();
        let quota = self.policy.login_quota;
        let (rate_limit, requests_last_min, frozen_remaining, used, next_login) = {
            let mut limits = self.limits.lock();
            let frozen_remaining = limits
                .frozen_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            let used = limits.login_load(now);
            let next_login = if limits.login_inflight >= quota {
                limits.logins.span()
            } else {
                let allowed = quota - limits.login_inflight;
                limits.logins.wait_for_capacity(now, allowed)
            };
            (
                limits.rate_limit,
                limits.requests.count(now),
                frozen_remaining,
                used,
                next_login,
            )
        };
        let node = self.node.read();

        ExitStatus {
            index: self.index,
            name: self.name(),
            kind: self.kind,
            port: self.port,
            node: node.as_ref().map(Node::key),
            protocol: node.as_ref().map(|n| n.protocol().to_string()),
            healthy: self.is_healthy(),
            active: self.active(),
            frozen: !frozen_remaining.is_zero(),
            frozen_remaining_secs: frozen_remaining.as_secs_f64(),
            rate_limit,
            requests_last_min,
            exit_ip: self.exit_ip().map(|ip| ip.to_string()),
            counters: self.counters(),
            login_cooldown: LoginCooldown {
                used,
                max: quota,
                remaining: quota.saturating_sub(used),
                next_available_in: next_login.as_secs_f64(),
            },
            consecutive_probe_failures: self.probe_failures(),
            recent_errors: self.recent_errors(),
        }
    }
}

fn build_client(port: Option<u16>, policy: &DispatchConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(policy.connect_timeout)
        .timeout(policy.request_timeout);

    builder = match port {
        // socks5h: hostnames are resolved by the tunnel, not locally
        Some(port) => builder.proxy(
            reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", port))
                .map_err(|e| EgressError::Internal(format!("proxy setup: {}", e)))?,
        ),
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| EgressError::Internal(format!("HTTP client setup: {}", e)))
}

/// Keeps `active` incremented for the lifetime of one request
#[derive(Debug)]
pub struct ActiveGuard {
    exit: Arc<Exit>,
}

impl ActiveGuard {
    pub fn exit(&self) -> &Arc<Exit> {
        &self.exit
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.exit.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// In-flight login slot. `confirm` moves it into the login window; dropping
/// it unconfirmed gives the slot back.
#[derive(Debug)]
pub struct LoginReservation {
    exit: Arc<Exit>,
    settled: bool,
}

impl LoginReservation {
    fn new(exit: Arc<Exit>) -> Self {
        Self {
            exit,
            settled: false,
        }
    }

    pub fn exit(&self) -> &Arc<Exit> {
        &self.exit
    }

    pub fn confirm(mut self) {
        {
            let mut limits = self.exit.limits.lock();
            limits.login_inflight = limits.login_inflight.saturating_sub(1);
            limits.logins.push(Instant::now());
        }
        self.exit.counters.logins.fetch_add(1, Ordering::Relaxed);
        self.settled = true;
    }
}

impl Drop for LoginReservation {
    fn drop(&mut self) {
        if !self.settled {
            let mut limits = self.exit.limits.lock();
            limits.login_inflight = limits.login_inflight.saturating_sub(1);
        }
    }
}
