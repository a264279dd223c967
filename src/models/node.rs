use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{EgressError, Result};

/// Names that subscription providers use for banner entries (traffic left,
/// expiry date, website) rather than real servers.
const INFORMATIONAL_MARKERS: &[&str] = &[
    "剩余流量",
    "套餐到期",
    "到期时间",
    "官网",
    "过期",
    "traffic left",
    "remaining traffic",
    "expire",
    "website",
];

/// A candidate egress target supplied by the catalog provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub params: NodeParams,
}

/// Protocol-specific connection parameters, passed through to the tunnel config renderer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum NodeParams {
    Vless {
        uuid: String,
        #[serde(default)]
        flow: Option<String>,
        #[serde(default)]
        tls: Option<TlsOptions>,
        #[serde(default)]
        transport: Option<Transport>,
    },
    Vmess {
        uuid: String,
        #[serde(default)]
        alter_id: u32,
        #[serde(default)]
        security: Option<String>,
        #[serde(default)]
        tls: Option<TlsOptions>,
        #[serde(default)]
        transport: Option<Transport>,
    },
    Trojan {
        password: String,
        #[serde(default)]
        tls: Option<TlsOptions>,
        #[serde(default)]
        transport: Option<Transport>,
    },
    #[serde(rename = "ss", alias = "shadowsocks")]
    Shadowsocks { method: String, password: String },
    Hysteria2 {
        password: String,
        #[serde(default)]
        sni: Option<String>,
        #[serde(default = "default_true")]
        insecure: bool,
        #[serde(default)]
        obfs: Option<String>,
        #[serde(default)]
        obfs_password: Option<String>,
    },
    Hysteria {
        auth: String,
        #[serde(default)]
        sni: Option<String>,
    },
    Tuic {
        uuid: String,
        password: String,
        #[serde(default)]
        sni: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub server_name: Option<String>,
    /// uTLS client fingerprint (e.g. "chrome")
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub reality: Option<RealityOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealityOptions {
    pub public_key: String,
    #[serde(default)]
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Ws {
        #[serde(default = "default_path")]
        path: String,
        #[serde(default)]
        host: Option<String>,
    },
    Grpc {
        #[serde(default)]
        service_name: String,
    },
    Http {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        host: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

fn default_path() -> String {
    "/".to_string()
}

impl NodeParams {
    pub fn protocol(&self) -> &'static str {
        match self {
            NodeParams::Vless { .. } => "vless",
            NodeParams::Vmess { .. } => "vmess",
            NodeParams::Trojan { .. } => "trojan",
            NodeParams::Shadowsocks { .. } => "ss",
            NodeParams::Hysteria2 { .. } => "hysteria2",
            NodeParams::Hysteria { .. } => "hysteria",
            NodeParams::Tuic { .. } => "tuic",
        }
    }
}

impl Node {
    /// Unique catalog key
    pub fn key(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Name for logs and status, falling back to the key
    pub fn label(&self) -> String {
        if self.name.trim().is_empty() {
            self.key()
        } else {
            self.name.clone()
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.params.protocol()
    }

    /// Provider banner entries that are not real servers
    pub fn is_informational(&self) -> bool {
        let name = self.name.to_lowercase();
        INFORMATIONAL_MARKERS.iter().any(|m| name.contains(m))
    }

    /// Check the node once at ingestion so malformed candidates never reach a tunnel
    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
            return Err(self.invalid("empty or local host"));
        }
        if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err(self.invalid("loopback or unspecified address"));
            }
        }
        if self.port == 0 {
            return Err(self.invalid("port must be non-zero"));
        }

        match &self.params {
            NodeParams::Vless { uuid, tls, .. } | NodeParams::Vmess { uuid, tls, .. } => {
                require(self, uuid, "uuid")?;
                validate_tls(self, tls.as_ref())
            }
            NodeParams::Trojan { password, tls, .. } => {
                require(self, password, "password")?;
                validate_tls(self, tls.as_ref())
            }
            NodeParams::Shadowsocks { method, password } => {
                require(self, method, "method")?;
                require(self, password, "password")
            }
            NodeParams::Hysteria2 { password, .. } => require(self, password, "password"),
            NodeParams::Hysteria { auth, .. } => require(self, auth, "auth"),
            NodeParams::Tuic { uuid, password, .. } => {
                require(self, uuid, "uuid")?;
                require(self, password, "password")
            }
        }
    }

    fn invalid(&self, reason: &str) -> EgressError {
        EgressError::NodeConfig {
            key: self.key(),
            reason: reason.to_string(),
        }
    }
}

fn require(node: &Node, value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(node.invalid(&format!("missing {}", field)));
    }
    Ok(())
}

fn validate_tls(node: &Node, tls: Option<&TlsOptions>) -> Result<()> {
    if let Some(reality) = tls.and_then(|t| t.reality.as_ref()) {
        require(node, &reality.public_key, "reality public_key")?;
    }
    Ok(())
}

/// Verification state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTier {
    Verified,
    Untested,
    Failed,
}

impl NodeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeTier::Verified => "verified",
            NodeTier::Untested => "untested",
            NodeTier::Failed => "failed",
        }
    }

    /// Short replenishment-tier label (T1 cheapest to use, T3 last resort)
    pub fn label(&self) -> &'static str {
        match self {
            NodeTier::Verified => "T1",
            NodeTier::Untested => "T2",
            NodeTier::Failed => "T3",
        }
    }
}

impl std::fmt::Display for NodeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Latest test result for a node key
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub verified: bool,
    pub tested_at: Instant,
    pub tested_at_wall: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    /// Consecutive failed tests; reset by a success
    pub fail_count: u32,
}

impl NodeScore {
    pub fn tier(&self, now: Instant, ttl: Duration) -> NodeTier {
        if now.saturating_duration_since(self.tested_at) > ttl {
            NodeTier::Untested
        } else if self.verified {
            NodeTier::Verified
        } else {
            NodeTier::Failed
        }
    }

    /// Latency used for ordering; untested or failed nodes sort last
    pub fn sort_latency(&self) -> f64 {
        match (self.verified, self.latency_ms) {
            (true, Some(ms)) => ms,
            _ => f64::MAX,
        }
    }
}

/// Per-node view for the status API
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub key: String,
    pub name: String,
    pub protocol: String,
    pub tier: NodeTier,
    pub tier_label: String,
    pub latency_ms: Option<f64>,
    pub verified: bool,
    pub fail_count: u32,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub in_use: bool,
    pub ready: bool,
}

/// Node counts per tier plus hot-standby fill
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogSummary {
    pub total: usize,
    pub verified: usize,
    pub untested: usize,
    pub failed: usize,
    pub ready: usize,
    pub ready_target: usize,
    pub in_use: usize,
}
