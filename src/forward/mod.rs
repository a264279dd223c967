//! Forward executor
//!
//! Runs a request through a picked exit, applies the exit's rate limit,
//! reacts to alert status codes and falls back to the direct exit once.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::catalog::NodeCatalog;
use crate::config::DispatchConfig;
use crate::dispatcher::{Dispatcher, Selection};
use crate::error::{EgressError, Result};
use crate::exit::{Exit, StatusAlert};
use crate::models::{ForwardResponse, OutboundRequest};

pub struct ForwardExecutor {
    dispatcher: Arc<Dispatcher>,
    catalog: Option<Arc<NodeCatalog>>,
    policy: DispatchConfig,
}

impl ForwardExecutor {
    pub fn new(dispatcher: Arc<Dispatcher>, policy: DispatchConfig) -> Self {
        Self {
            dispatcher,
            catalog: None,
            policy,
        }
    }

    /// Feed tunnel outcomes of forwarded traffic into node scores
    pub fn with_catalog(mut self, catalog: Arc<NodeCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Pick an exit for the request's class and forward through it
    pub async fn execute(&self, request: &OutboundRequest) -> Result<ForwardResponse> {
        let selection = self.dispatcher.pick(request.login);
        self.forward(selection, request).await
    }

    /// Forward `request` through the selected exit.
    ///
    /// A tunnel transport failure is retried once through direct, as is a 403
    /// when `retry_blocked_via_direct` is set. Direct failures are returned.
    #[instrument(skip_all, fields(exit = %selection.exit().name(), login = request.login, url = %request.url))]
    pub async fn forward(
        &self,
        mut selection: Selection,
        request: &OutboundRequest,
    ) -> Result<ForwardResponse> {
        let exit = selection.exit().clone();
        exit.admit_request().await;
        let node_key = exit.node_key();
        let started = Instant::now();

        match send(&exit, request).await {
            Ok(response) => {
                if request.login {
                    selection.confirm_login();
                }
                let alert = exit.record_status(response.status.as_u16());
                if alert != StatusAlert::None {
                    warn!(status = response.status.as_u16(), ?alert, "Alert status from destination");
                }
                match alert {
                    StatusAlert::Blocked => self.score_node(node_key.as_deref(), false, None),
                    StatusAlert::None if response.status.as_u16() < 400 => {
                        self.score_node(node_key.as_deref(), true, Some(started.elapsed()))
                    }
                    _ => {}
                }

                if alert == StatusAlert::Blocked
                    && !exit.is_direct()
                    && self.policy.retry_blocked_via_direct
                {
                    drop(selection);
                    info!("Blocked on tunnel exit; retrying once via direct");
                    return self.via_direct(request).await;
                }
                Ok(response)
            }
            Err(e) => {
                exit.record_error(e.to_string());
                self.score_node(node_key.as_deref(), false, None);
                drop(selection);

                if exit.is_direct() {
                    return Err(e);
                }
                warn!(error = %e, "Tunnel transport failure; retrying once via direct");
                self.via_direct(request).await
            }
        }
    }

    async fn via_direct(&self, request: &OutboundRequest) -> Result<ForwardResponse> {
        let direct = self.dispatcher.direct();
        let _guard = direct.acquire();
        let reservation = if request.login {
            let reservation = direct.try_reserve_login();
            if reservation.is_none() {
                warn!(
                    wait_secs = direct.login_available_in().as_secs_f64(),
                    "Direct exit at login quota; retrying login over quota"
                );
            }
            reservation
        } else {
            None
        };
        direct.admit_request().await;

        match send(&direct, request).await {
            Ok(mut response) => {
                match reservation {
                    Some(reservation) => reservation.confirm(),
                    None if request.login => direct.record_login_over_quota(),
                    None => {}
                }
                direct.record_status(response.status.as_u16());
                response.retried_via_direct = true;
                Ok(response)
            }
            Err(e) => {
                direct.record_error(e.to_string());
                Err(e)
            }
        }
    }

    fn score_node(&self, key: Option<&str>, ok: bool, latency: Option<Duration>) {
        if let (Some(catalog), Some(key)) = (&self.catalog, key) {
            catalog.record_test(key, ok, latency);
        }
    }
}

async fn send(exit: &Exit, request: &OutboundRequest) -> Result<ForwardResponse> {
    let client = exit.client();
    let mut builder = client.request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
        if !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    let response = builder
        .body(request.body.clone())
        .send()
        .await
        .map_err(|e| classify(exit, e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| classify(exit, e))?;
    debug!(status = status.as_u16(), bytes = body.len(), "Upstream responded");

    Ok(ForwardResponse {
        status,
        headers,
        body,
        exit_index: exit.index(),
        exit_name: exit.name(),
        retried_via_direct: false,
    })
}

fn classify(exit: &Exit, err: reqwest::Error) -> EgressError {
    if err.is_timeout() {
        return EgressError::Timeout;
    }
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    EgressError::transport(exit.name(), message)
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::models::NodeTier;
    use crate::test_utils::{
        bound_exit, free_port, spawn_http_responder, spawn_http_server, spawn_socks5_proxy,
        test_node,
    };
    use http::StatusCode;
    use tokio::net::TcpListener;

    fn policy() -> DispatchConfig {
        DispatchConfig {
            login_quota: 5,
            ..DispatchConfig::default()
        }
    }

    fn setup(tunnel_port: u16, policy: &DispatchConfig) -> (Arc<Dispatcher>, ForwardExecutor) {
        let direct = Arc::new(Exit::direct(policy).unwrap());
        let tunnel = bound_exit(1, tunnel_port, policy);
        let dispatcher = Arc::new(Dispatcher::new(vec![direct, tunnel]).unwrap());
        let executor = ForwardExecutor::new(dispatcher.clone(), policy.clone());
        (dispatcher, executor)
    }

    fn via(dispatcher: &Dispatcher, index: usize, login: bool) -> Selection {
        let exit = dispatcher.get(index).unwrap();
        let reservation = if login { exit.try_reserve_login() } else { None };
        Selection::new(exit.acquire(), reservation)
    }

    #[tokio::test]
    async fn test_forward_through_tunnel() {
        let target = spawn_http_responder(200, "hello").await;
        let proxy = spawn_socks5_proxy().await;
        let policy = policy();
        let (dispatcher, executor) = setup(proxy.port(), &policy);

        let req = OutboundRequest::get(&format!("http://{}/a", target))
            .unwrap()
            .login();
        let resp = executor.forward(via(&dispatcher, 1, true), &req).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.text(), "hello");
        assert_eq!(resp.exit_index, 1);
        assert!(!resp.retried_via_direct);
        assert_eq!(proxy.connections(), 1);

        let tunnel = dispatcher.get(1).unwrap();
        assert_eq!(tunnel.active(), 0);
        assert_eq!(tunnel.login_load(), 1);
        assert_eq!(tunnel.counters().total_requests, 1);
        assert_eq!(tunnel.counters().login_requests, 1);
    }

    #[tokio::test]
    async fn test_blocked_tunnel_is_frozen_and_retried_via_direct() {
        // first request (through the tunnel) is blocked, the retry succeeds
        let target = spawn_http_server(|n, _| {
            if n == 0 {
                (403, "denied".to_string())
            } else {
                (200, "ok".to_string())
            }
        })
        .await;
        let proxy = spawn_socks5_proxy().await;
        let policy = policy();
        let (dispatcher, executor) = setup(proxy.port(), &policy);

        let req = OutboundRequest::get(&format!("http://{}/", target)).unwrap();
        let resp = executor.forward(via(&dispatcher, 1, false), &req).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert!(resp.retried_via_direct);
        assert_eq!(resp.exit_index, 0);

        let tunnel = dispatcher.get(1).unwrap();
        assert!(tunnel.is_frozen());
        assert!(tunnel.rate_limit() >= policy.throttle_floor);
        assert_eq!(tunnel.counters().warn_403, 1);
        assert_eq!(tunnel.active(), 0);
        assert_eq!(dispatcher.direct().counters().total_requests, 1);
        assert_eq!(dispatcher.direct().active(), 0);
    }

    #[tokio::test]
    async fn test_blocked_without_retry_returns_403() {
        let target = spawn_http_responder(403, "denied").await;
        let proxy = spawn_socks5_proxy().await;
        let policy = DispatchConfig {
            retry_blocked_via_direct: false,
            ..policy()
        };
        let (dispatcher, executor) = setup(proxy.port(), &policy);

        let req = OutboundRequest::get(&format!("http://{}/", target)).unwrap();
        let resp = executor.forward(via(&dispatcher, 1, false), &req).await.unwrap();
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
        assert!(!resp.retried_via_direct);
        assert!(resp.error_for_blocked().is_err());
        assert!(dispatcher.get(1).unwrap().is_frozen());
    }

    #[tokio::test]
    async fn test_rate_limited_tunnel_is_throttled_not_retried() {
        let target = spawn_http_responder(429, "slow down").await;
        let proxy = spawn_socks5_proxy().await;
        let policy = policy();
        let (dispatcher, executor) = setup(proxy.port(), &policy);

        let req = OutboundRequest::get(&format!("http://{}/", target)).unwrap();
        let resp = executor.forward(via(&dispatcher, 1, false), &req).await.unwrap();

        assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(!resp.retried_via_direct);
        let tunnel = dispatcher.get(1).unwrap();
        assert_eq!(tunnel.counters().warn_429, 1);
        assert_eq!(tunnel.rate_limit(), policy.throttle_floor);
        assert!(!tunnel.is_frozen());
    }

    #[tokio::test]
    async fn test_tunnel_transport_failure_retries_via_direct() {
        let target = spawn_http_responder(200, "direct").await;
        let policy = policy();
        let (dispatcher, executor) = setup(free_port(), &policy);

        let req = OutboundRequest::get(&format!("http://{}/", target))
            .unwrap()
            .login();
        let resp = executor.forward(via(&dispatcher, 1, true), &req).await.unwrap();

        assert_eq!(resp.text(), "direct");
        assert!(resp.retried_via_direct);

        let tunnel = dispatcher.get(1).unwrap();
        assert_eq!(tunnel.counters().errors, 1);
        assert_eq!(tunnel.recent_errors().len(), 1);
        // the failed login never entered the tunnel's window
        assert_eq!(tunnel.login_load(), 0);
        assert_eq!(dispatcher.direct().login_load(), 1);
    }

    #[tokio::test]
    async fn test_direct_failure_is_surfaced() {
        let policy = policy();
        let (dispatcher, executor) = setup(free_port(), &policy);
        let closed = free_port();

        let req = OutboundRequest::get(&format!("http://127.0.0.1:{}/", closed)).unwrap();
        let err = executor
            .forward(via(&dispatcher, 0, false), &req)
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(dispatcher.direct().counters().errors, 1);
        assert_eq!(dispatcher.direct().active(), 0);
    }

    #[tokio::test]
    async fn test_both_paths_failing_surfaces_direct_error() {
        let policy = policy();
        let (dispatcher, executor) = setup(free_port(), &policy);
        let closed = free_port();

        let req = OutboundRequest::get(&format!("http://127.0.0.1:{}/", closed)).unwrap();
        let err = executor
            .forward(via(&dispatcher, 1, false), &req)
            .await
            .unwrap_err();

        assert!(matches!(err, EgressError::Transport { ref exit, .. } if exit == "direct"));
        assert_eq!(dispatcher.get(1).unwrap().counters().errors, 1);
        assert_eq!(dispatcher.direct().counters().errors, 1);
    }

    #[tokio::test]
    async fn test_execute_picks_and_forwards() {
        let target = spawn_http_server(|_, head| {
            // hop-by-hop headers are stripped
            let leaked = head.to_lowercase().contains("proxy-authorization");
            (200, format!("leaked={}", leaked))
        })
        .await;
        let proxy = spawn_socks5_proxy().await;
        let policy = policy();
        let (_dispatcher, executor) = setup(proxy.port(), &policy);

        let req = OutboundRequest::get(&format!("http://{}/", target))
            .unwrap()
            .header("proxy-authorization", "Basic abc")
            .unwrap()
            .header("x-trace", "1")
            .unwrap();
        let resp = executor.execute(&req).await.unwrap();
        assert_eq!(resp.text(), "leaked=false");
    }

    fn scored(dispatcher: &Arc<Dispatcher>, policy: &DispatchConfig) -> (Arc<NodeCatalog>, ForwardExecutor) {
        let catalog = Arc::new(NodeCatalog::new(
            vec![test_node(1)],
            CatalogConfig::default(),
            1,
        ));
        catalog.mark_bound(&test_node(1).key());
        let executor =
            ForwardExecutor::new(dispatcher.clone(), policy.clone()).with_catalog(catalog.clone());
        (catalog, executor)
    }

    #[tokio::test]
    async fn test_blocked_tunnel_fails_its_node() {
        let target = spawn_http_responder(403, "denied").await;
        let proxy = spawn_socks5_proxy().await;
        let policy = policy();
        let (dispatcher, _) = setup(proxy.port(), &policy);
        let (catalog, executor) = scored(&dispatcher, &policy);
        let key = test_node(1).key();
        catalog.record_test(&key, true, Some(Duration::from_millis(40)));

        let req = OutboundRequest::get(&format!("http://{}/", target)).unwrap();
        executor.forward(via(&dispatcher, 1, false), &req).await.unwrap();

        assert_eq!(catalog.tier(&key), NodeTier::Failed);
        assert_eq!(catalog.score(&key).unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn test_tunnel_transport_failure_fails_its_node() {
        let target = spawn_http_responder(200, "direct").await;
        let policy = policy();
        let (dispatcher, _) = setup(free_port(), &policy);
        let (catalog, executor) = scored(&dispatcher, &policy);
        let key = test_node(1).key();

        let req = OutboundRequest::get(&format!("http://{}/", target)).unwrap();
        let resp = executor.forward(via(&dispatcher, 1, false), &req).await.unwrap();

        assert!(resp.retried_via_direct);
        assert_eq!(catalog.tier(&key), NodeTier::Failed);
        assert_eq!(catalog.score(&key).unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn test_tunnel_success_refreshes_its_node() {
        let target = spawn_http_responder(200, "ok").await;
        let proxy = spawn_socks5_proxy().await;
        let policy = policy();
        let (dispatcher, _) = setup(proxy.port(), &policy);
        let (catalog, executor) = scored(&dispatcher, &policy);
        let key = test_node(1).key();
        catalog.record_test(&key, false, None);

        let req = OutboundRequest::get(&format!("http://{}/", target)).unwrap();
        executor.forward(via(&dispatcher, 1, false), &req).await.unwrap();

        let score = catalog.score(&key).unwrap();
        assert_eq!(catalog.tier(&key), NodeTier::Verified);
        assert_eq!(score.fail_count, 0);
        assert!(score.latency_ms.is_some());
        // still serving the exit, so never offered as a standby
        assert!(catalog.ready_keys().is_empty());
    }

    #[tokio::test]
    async fn test_logins_over_quota_are_counted() {
        let target = spawn_http_responder(200, "ok").await;
        let policy = DispatchConfig {
            login_quota: 1,
            ..DispatchConfig::default()
        };
        let (dispatcher, executor) = setup(free_port(), &policy);
        dispatcher.get(1).unwrap().mark_unhealthy();

        let req = OutboundRequest::get(&format!("http://{}/", target))
            .unwrap()
            .login();
        for _ in 0..3 {
            let resp = executor.execute(&req).await.unwrap();
            assert_eq!(resp.exit_index, 0);
        }

        let status = dispatcher.direct().status();
        assert_eq!(status.counters.total_requests, 3);
        assert_eq!(status.counters.login_requests, 3);
        assert_eq!(status.counters.login_over_quota, 2);
        // the window itself never passes the quota
        assert_eq!(status.login_cooldown.used, 1);
    }

    #[tokio::test]
    async fn test_over_quota_direct_retry_is_counted() {
        let target = spawn_http_responder(200, "direct").await;
        let policy = DispatchConfig {
            login_quota: 1,
            ..DispatchConfig::default()
        };
        let (dispatcher, executor) = setup(free_port(), &policy);
        // fill direct's quota so the retry has no reservation
        dispatcher.direct().try_reserve_login().unwrap().confirm();

        let req = OutboundRequest::get(&format!("http://{}/", target))
            .unwrap()
            .login();
        let resp = executor.forward(via(&dispatcher, 1, true), &req).await.unwrap();

        assert!(resp.retried_via_direct);
        let counters = dispatcher.direct().counters();
        assert_eq!(counters.login_requests, 2);
        assert_eq!(counters.login_over_quota, 1);
        assert_eq!(dispatcher.direct().login_load(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_forward_releases_active_and_login() {
        // accepts connections and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let policy = policy();
        let (dispatcher, executor) = setup(free_port(), &policy);
        let executor = Arc::new(executor);
        let req = OutboundRequest::get(&format!("http://{}/", target))
            .unwrap()
            .login();
        let selection = via(&dispatcher, 0, true);
        let task = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.forward(selection, &req).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        let direct = dispatcher.direct();
        assert_eq!(direct.active(), 1);
        assert_eq!(direct.login_load(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(direct.active(), 0);
        assert_eq!(direct.login_load(), 0);
        assert_eq!(direct.counters().login_requests, 0);
        silent.abort();
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("cookie"));
    }
}
