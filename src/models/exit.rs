use serde::{Deserialize, Serialize};

/// Egress path type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitKind {
    Direct,
    Tunnel,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::Direct => "direct",
            ExitKind::Tunnel => "tunnel",
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cumulative per-exit counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitCounters {
    pub total_requests: u64,
    pub login_requests: u64,
    /// Logins sent without a quota reservation (all exits full)
    pub login_over_quota: u64,
    pub errors: u64,
    pub warn_403: u64,
    pub warn_429: u64,
    pub warn_503: u64,
}

/// Login quota usage in the trailing window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginCooldown {
    /// Confirmed plus in-flight logins
    pub used: usize,
    pub max: usize,
    pub remaining: usize,
    /// Seconds until one more login fits
    pub next_available_in: f64,
}

/// Point-in-time view of an exit for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ExitStatus {
    pub index: usize,
    pub name: String,
    pub kind: ExitKind,
    pub port: Option<u16>,
    pub node: Option<String>,
    pub protocol: Option<String>,
    pub healthy: bool,
    pub active: usize,
    pub frozen: bool,
    pub frozen_remaining_secs: f64,
    /// Requests per window; 0 means unbounded
    pub rate_limit: u32,
    pub requests_last_min: usize,
    pub exit_ip: Option<String>,
    pub counters: ExitCounters,
    pub login_cooldown: LoginCooldown,
    pub consecutive_probe_failures: u32,
    pub recent_errors: Vec<String>,
}

/// Aggregate dispatcher view
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSummary {
    pub total: usize,
    pub healthy: usize,
    pub frozen: usize,
    pub throttled: usize,
    pub active: usize,
    pub summary: String,
}
