//! Health probing for tunnel exits
//!
//! Periodically probes every tunnel exit through its local port, updates the
//! exit's health flag and, when needed, its egress IP.

mod ip;

pub use ip::{parse_ip_response, IpDetector};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use hyper::StatusCode;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::catalog::NodeCatalog;
use crate::config::HealthConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{EgressError, Result};
use crate::exit::Exit;
use crate::transport;

/// Liveness check and IP lookup for an exit
#[async_trait]
pub trait ExitProbe: Send + Sync {
    /// Probe the exit; returns the round-trip latency on success
    async fn check(&self, exit: &Exit) -> Result<Duration>;

    /// Public address the exit egresses from
    async fn detect_ip(&self, exit: &Exit) -> Option<IpAddr>;
}

/// Status codes a connectivity check URL answers with when reachable
pub fn is_probe_success(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 204 | 301 | 302)
}

/// Request `url` once through `socks_port` and time it
pub async fn probe_once(socks_port: Option<u16>, url: &str, deadline: Duration) -> Result<Duration> {
    let response = transport::get(socks_port, url, deadline).await?;
    if is_probe_success(response.status) {
        Ok(response.elapsed)
    } else {
        Err(EgressError::Http(format!(
            "probe returned status {}",
            response.status.as_u16()
        )))
    }
}

/// Probes over plain HTTP through the exit's SOCKS port
pub struct HttpProbe {
    url: String,
    timeout: Duration,
    ip: IpDetector,
}

impl HttpProbe {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            url: config.probe_url.clone(),
            timeout: config.timeout,
            ip: IpDetector::new(config.ip_services.clone(), config.ip_timeout),
        }
    }
}

#[async_trait]
impl ExitProbe for HttpProbe {
    async fn check(&self, exit: &Exit) -> Result<Duration> {
        probe_once(exit.port(), &self.url, self.timeout).await
    }

    async fn detect_ip(&self, exit: &Exit) -> Option<IpAddr> {
        self.ip.detect(exit.port()).await
    }
}

/// Outcome of one probe round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub healthy: usize,
    pub unhealthy: usize,
    pub skipped: usize,
}

/// Health prober for tunnel exits
pub struct HealthProber {
    dispatcher: Arc<Dispatcher>,
    catalog: Option<Arc<NodeCatalog>>,
    probe: Arc<dyn ExitProbe>,
    config: HealthConfig,
}

impl HealthProber {
    pub fn new(dispatcher: Arc<Dispatcher>, probe: Arc<dyn ExitProbe>, config: HealthConfig) -> Self {
        Self {
            dispatcher,
            catalog: None,
            probe,
            config,
        }
    }

    /// Feed probe outcomes into node scores
    pub fn with_catalog(mut self, catalog: Arc<NodeCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Run the prober (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health prober with {}s interval",
            self.config.interval.as_secs()
        );

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let round = self.check_all().await;
                    info!(
                        "Probe round complete: {} healthy, {} unhealthy, {} unbound",
                        round.healthy, round.unhealthy, round.skipped
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health prober shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every tunnel exit concurrently
    pub async fn check_all(&self) -> ProbeRound {
        let tunnels = self.dispatcher.tunnels();
        let results = join_all(tunnels.iter().map(|exit| self.check_exit(exit))).await;

        let mut round = ProbeRound::default();
        for result in results {
            match result {
                Some(true) => round.healthy += 1,
                Some(false) => round.unhealthy += 1,
                None => round.skipped += 1,
            }
        }
        round
    }

    /// Probe one exit. `None` when the exit has no node bound.
    #[instrument(skip(self, exit), fields(exit = %exit.name(), port = exit.port()))]
    pub async fn check_exit(&self, exit: &Arc<Exit>) -> Option<bool> {
        let key = exit.node_key()?;
        let result = self.probe.check(exit).await;

        // The exit may have been rebuilt onto another node meanwhile
        if exit.node_key().as_deref() != Some(key.as_str()) {
            debug!("Exit rebound during probe; discarding result");
            return None;
        }

        match result {
            Ok(latency) => {
                let recovered = exit.mark_healthy();
                if let Some(catalog) = &self.catalog {
                    catalog.record_test(&key, true, Some(latency));
                }
                if recovered {
                    info!(latency_ms = latency.as_millis() as u64, "Exit recovered");
                }
                if recovered || exit.exit_ip().is_none() {
                    self.detect_exit_ip(exit).await;
                }
                Some(true)
            }
            Err(e) => {
                let failures = exit.mark_unhealthy();
                exit.record_error(format!("probe: {}", e));
                if let Some(catalog) = &self.catalog {
                    catalog.record_test(&key, false, None);
                }
                warn!(failures, "Exit probe failed: {}", e);
                Some(false)
            }
        }
    }

    /// Detect the egress IP of every exit, direct included
    pub async fn detect_all_ips(&self) -> usize {
        let exits = self.dispatcher.exits();
        let found = join_all(
            exits
                .iter()
                .filter(|e| e.is_direct() || e.node_key().is_some())
                .map(|exit| self.detect_exit_ip(exit)),
        )
        .await;
        found.iter().filter(|ip| ip.is_some()).count()
    }

    pub async fn detect_exit_ip(&self, exit: &Arc<Exit>) -> Option<IpAddr> {
        let ip = self.probe.detect_ip(exit).await?;
        if exit.set_exit_ip(ip) {
            info!(exit = %exit.name(), %ip, "Egress IP updated");
        }
        Some(ip)
    }
}
