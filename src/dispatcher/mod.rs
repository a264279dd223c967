//! Exit selection
//!
//! Least-active-connections over the available exits, with rate-limited
//! exits ranked last and login picks gated by the per-exit login quota.
//! Picks never fail: when nothing else qualifies they fall back to the
//! direct exit.

mod selection;

pub use selection::Selection;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, error, warn};

use crate::error::{EgressError, Result};
use crate::exit::{ActiveGuard, Exit};
use crate::models::{DispatcherSummary, ExitStatus};

/// Holds the exit list (direct at slot 0) and picks exits for requests
pub struct Dispatcher {
    exits: ArcSwap<Vec<Arc<Exit>>>,
}

impl Dispatcher {
    /// Create a dispatcher from `exits`, which must start with the direct exit
    pub fn new(exits: Vec<Arc<Exit>>) -> Result<Self> {
        match exits.first() {
            Some(first) if first.is_direct() => {}
            _ => {
                return Err(EgressError::InvalidConfig(
                    "the first exit must be the direct exit".into(),
                ))
            }
        }
        if exits.iter().skip(1).any(|e| e.is_direct()) {
            return Err(EgressError::InvalidConfig(
                "only slot 0 may hold the direct exit".into(),
            ));
        }

        Ok(Self {
            exits: ArcSwap::from_pointee(exits),
        })
    }

    /// Snapshot of all exits, direct first
    pub fn exits(&self) -> Arc<Vec<Arc<Exit>>> {
        self.exits.load_full()
    }

    pub fn direct(&self) -> Arc<Exit> {
        self.exits.load()[0].clone()
    }

    pub fn get(&self, index: usize) -> Option<Arc<Exit>> {
        self.exits.load().get(index).cloned()
    }

    pub fn tunnels(&self) -> Vec<Arc<Exit>> {
        self.exits.load().iter().skip(1).cloned().collect()
    }

    /// Swap the tunnel exits; the direct exit is kept
    pub fn replace_tunnels(&self, tunnels: Vec<Arc<Exit>>) {
        let mut exits = Vec::with_capacity(tunnels.len() + 1);
        exits.push(self.direct());
        exits.extend(tunnels.into_iter().filter(|e| !e.is_direct()));
        self.exits.store(Arc::new(exits));
    }

    pub fn pick_for_login(&self) -> Selection {
        self.pick(true)
    }

    pub fn pick_for_generic(&self) -> Selection {
        self.pick(false)
    }

    /// Pick an exit. Never fails and never waits.
    pub fn pick(&self, login: bool) -> Selection {
        match catch_unwind(AssertUnwindSafe(|| self.select(login))) {
            Ok(selection) => selection,
            Err(_) => {
                error!(login, "Exit selection panicked; using direct exit");
                self.direct_selection(login)
            }
        }
    }

    fn select(&self, login: bool) -> Selection {
        let exits = self.exits.load();
        let available: Vec<&Arc<Exit>> = exits.iter().filter(|e| e.is_available()).collect();

        if available.is_empty() {
            debug!(login, "No available exit; using direct");
            return self.direct_selection(login);
        }

        if login {
            self.select_login(&available)
        } else {
            Selection::new(acquire_least_active(&available), None)
        }
    }

    fn select_login(&self, available: &[&Arc<Exit>]) -> Selection {
        let mut ranked: Vec<(bool, usize, usize, &Arc<Exit>)> = available
            .iter()
            .map(|e| (e.rate_limit() > 0, e.active(), e.login_load(), *e))
            .collect();
        ranked.sort_by_key(|(throttled, active, load, e)| (*throttled, *active, *load, e.index()));

        for (_, _, _, exit) in &ranked {
            if let Some(reservation) = exit.try_reserve_login() {
                return Selection::new(exit.acquire(), Some(reservation));
            }
        }

        // Every available exit is at quota: use the one that frees up first,
        // without entering the login into its window.
        let Some(exit) = available.iter().min_by_key(|e| e.login_available_in()) else {
            return self.direct_selection(true);
        };
        warn!(
            exit = %exit.name(),
            wait_secs = exit.login_available_in().as_secs_f64(),
            "All exits at login quota; sending over quota"
        );
        Selection::new(exit.acquire(), None)
    }

    fn direct_selection(&self, login: bool) -> Selection {
        let direct = self.direct();
        let reservation = if login {
            direct.try_reserve_login()
        } else {
            None
        };
        Selection::new(direct.acquire(), reservation)
    }

    pub fn statuses(&self) -> Vec<ExitStatus> {
        self.exits.load().iter().map(|e| e.status()).collect()
    }

    pub fn summary(&self) -> DispatcherSummary {
        let exits = self.exits.load();
        let total = exits.len();
        let healthy = exits.iter().filter(|e| e.is_healthy()).count();
        let frozen = exits.iter().filter(|e| e.is_frozen()).count();
        let throttled = exits.iter().filter(|e| e.rate_limit() > 0).count();
        let active = exits.iter().map(|e| e.active()).sum();

        DispatcherSummary {
            total,
            healthy,
            frozen,
            throttled,
            active,
            summary: format!("{}/{} healthy, {} active", healthy, total, active),
        }
    }
}

/// Increment `active` on the least busy exit, unthrottled exits first.
///
/// The increment is a CAS against the count the choice was made on, so
/// concurrent picks cannot pile onto the same exit.
fn acquire_least_active(candidates: &[&Arc<Exit>]) -> ActiveGuard {
    loop {
        let best = candidates
            .iter()
            .map(|e| (e.rate_limit() > 0, e.active(), e.index(), *e))
            .min_by_key(|(throttled, active, index, _)| (*throttled, *active, *index));

        if let Some((_, active, _, exit)) = best {
            if let Some(guard) = exit.try_acquire(active) {
                return guard;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::models::{Node, NodeParams};
    use std::collections::HashMap;
    use std::time::Duration;

    fn policy(quota: usize) -> DispatchConfig {
        DispatchConfig {
            login_quota: quota,
            ..DispatchConfig::default()
        }
    }

    fn node(i: usize) -> Node {
        Node {
            name: format!("node-{}", i),
            host: format!("n{}.example.net", i),
            port: 443,
            params: NodeParams::Shadowsocks {
                method: "aes-128-gcm".to_string(),
                password: "pw".to_string(),
            },
        }
    }

    fn dispatcher(tunnels: usize, quota: usize) -> Dispatcher {
        let policy = policy(quota);
        let mut exits = vec![Arc::new(Exit::direct(&policy).unwrap())];
        for i in 1..=tunnels {
            let exit = Exit::tunnel(i, 21000 + i as u16, &policy).unwrap();
            exit.bind(node(i)).unwrap();
            exits.push(Arc::new(exit));
        }
        Dispatcher::new(exits).unwrap()
    }

    #[tokio::test]
    async fn test_new_requires_direct_first() {
        let policy = policy(5);
        let tunnel = Arc::new(Exit::tunnel(1, 21000, &policy).unwrap());
        assert!(Dispatcher::new(vec![tunnel]).is_err());
        assert!(Dispatcher::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn test_generic_picks_are_balanced() {
        let d = dispatcher(5, 10);
        let held: Vec<Selection> = (0..37).map(|_| d.pick_for_generic()).collect();

        let actives: Vec<usize> = d.exits().iter().map(|e| e.active()).collect();
        let max = *actives.iter().max().unwrap();
        let min = *actives.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced: {:?}", actives);
        assert_eq!(actives.iter().sum::<usize>(), 37);

        drop(held);
        assert!(d.exits().iter().all(|e| e.active() == 0));
    }

    #[tokio::test]
    async fn test_concurrent_generic_picks_are_balanced() {
        let d = Arc::new(dispatcher(5, 10));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let d = d.clone();
            handles.push(std::thread::spawn(move || {
                (0..30).map(|_| d.pick_for_generic()).collect::<Vec<_>>()
            }));
        }
        let held: Vec<Vec<Selection>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let actives: Vec<usize> = d.exits().iter().map(|e| e.active()).collect();
        assert_eq!(actives.iter().sum::<usize>(), 240);
        let max = *actives.iter().max().unwrap();
        let min = *actives.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced: {:?}", actives);
        drop(held);
    }

    #[tokio::test]
    async fn test_throttled_exits_ranked_last() {
        let d = dispatcher(2, 10);
        d.get(1).unwrap().throttle();
        d.get(2).unwrap().throttle();

        let first = d.pick_for_generic();
        assert!(first.is_direct());
        // direct is busier now but still preferred over throttled exits
        let second = d.pick_for_generic();
        assert!(second.is_direct());
    }

    #[tokio::test]
    async fn test_login_quota_never_exceeded() {
        let d = dispatcher(5, 10);
        let mut per_exit: HashMap<usize, usize> = HashMap::new();
        let mut held = Vec::new();

        for _ in 0..60 {
            let mut sel = d.pick_for_login();
            assert!(sel.has_login_reservation());
            sel.confirm_login();
            *per_exit.entry(sel.exit().index()).or_default() += 1;
            held.push(sel);
        }

        for exit in d.exits().iter() {
            assert_eq!(exit.login_load(), 10, "exit {}", exit.index());
            assert_eq!(per_exit[&exit.index()], 10);
        }

        // over quota everywhere: still returns an exit, without a reservation
        let mut extra = d.pick_for_login();
        assert!(!extra.has_login_reservation());
        assert!(d.exits().iter().all(|e| e.login_load() == 10));

        // counted as over quota, kept out of the window
        extra.confirm_login();
        let counters = extra.exit().counters();
        assert_eq!(counters.login_requests, 11);
        assert_eq!(counters.login_over_quota, 1);
        assert_eq!(extra.exit().login_load(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_login_picks_respect_quota() {
        let d = Arc::new(dispatcher(5, 10));
        let mut tasks = Vec::new();
        for _ in 0..60 {
            let d = d.clone();
            tasks.push(tokio::spawn(async move {
                let mut sel = d.pick_for_login();
                tokio::task::yield_now().await;
                sel.confirm_login();
                sel.exit().index()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        for exit in d.exits().iter() {
            assert!(exit.login_load() <= 10);
        }
        let total: usize = d.exits().iter().map(|e| e.login_load()).sum();
        assert_eq!(total, 60);
    }

    #[tokio::test]
    async fn test_cancelled_login_returns_slot() {
        let d = dispatcher(0, 1);
        let sel = d.pick_for_login();
        assert!(sel.is_direct());
        assert!(sel.has_login_reservation());
        assert_eq!(d.direct().login_load(), 1);
        drop(sel);
        assert_eq!(d.direct().login_load(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frozen_exit_excluded_for_freeze_duration() {
        let d = dispatcher(1, 10);
        let tunnel = d.get(1).unwrap();
        tunnel.record_status(403);

        let picks: Vec<Selection> = (0..4).map(|_| d.pick_for_generic()).collect();
        assert!(picks.iter().all(|s| s.is_direct()));
        drop(picks);

        tokio::time::advance(Duration::from_secs(60)).await;
        let a = d.pick_for_generic();
        let b = d.pick_for_generic();
        assert!(a.is_direct() != b.is_direct());
    }

    #[tokio::test]
    async fn test_all_tunnels_down_falls_back_to_direct() {
        let d = dispatcher(3, 10);
        for exit in d.tunnels() {
            exit.mark_unhealthy();
        }
        d.get(1).unwrap().freeze();

        assert!(d.pick_for_generic().is_direct());
        let login = d.pick_for_login();
        assert!(login.is_direct());
        assert!(login.has_login_reservation());
    }

    #[tokio::test]
    async fn test_replace_tunnels_keeps_direct() {
        let d = dispatcher(2, 10);
        let direct = d.direct();
        d.replace_tunnels(vec![]);
        assert_eq!(d.exits().len(), 1);
        assert!(Arc::ptr_eq(&d.direct(), &direct));
    }

    #[tokio::test]
    async fn test_summary_line() {
        let d = dispatcher(2, 10);
        d.get(2).unwrap().mark_unhealthy();
        let _sel = d.pick_for_generic();

        let summary = d.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.summary, "2/3 healthy, 1 active");
        assert_eq!(d.statuses().len(), 3);
    }
}
