use crate::error::{EgressError, Result};
use crate::transport::parse_http_url;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Selection, throttling and forwarding policy
    pub dispatch: DispatchConfig,
    /// Health prober configuration
    pub health: HealthConfig,
    /// Tunnel process manager configuration
    pub tunnel: TunnelConfig,
    /// Node catalog / hot-standby configuration
    pub catalog: CatalogConfig,
    /// Status API server configuration
    pub api: ApiServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum logins per exit in the trailing window
    pub login_quota: usize,
    /// Length of the trailing window used for logins and request rates
    pub window: Duration,
    /// How long an exit is excluded after a 403
    pub freeze_duration: Duration,
    /// Share of the observed rate used as the first throttle limit
    pub throttle_ratio: f64,
    /// Multiplier applied to an existing throttle limit on each further block
    pub throttle_step: f64,
    /// Lowest limit adaptive throttling will set (requests per window)
    pub throttle_floor: u32,
    /// Retry a 403'd tunnel request once through the direct exit
    pub retry_blocked_via_direct: bool,
    /// Timeout for the whole forwarded request
    pub request_timeout: Duration,
    /// Timeout for establishing the upstream connection
    pub connect_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            login_quota: 8,
            window: Duration::from_secs(60),
            freeze_duration: Duration::from_secs(60),
            throttle_ratio: 0.9,
            throttle_step: 0.9,
            throttle_floor: 5,
            retry_blocked_via_direct: true,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between probe rounds
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// URL probed through each tunnel
    pub probe_url: String,
    /// "What is my IP" services, queried in order
    pub ip_services: Vec<String>,
    /// Timeout for each IP service query
    pub ip_timeout: Duration,
    /// Consecutive failed probes after which a tunnel exit is rebuilt
    pub rebuild_after_failures: u32,
    /// Interval of the exit maintenance loop
    pub maintenance_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            probe_url: "http://connectivitycheck.gstatic.com/generate_204".to_string(),
            ip_services: vec![
                "http://ip.3322.net".to_string(),
                "http://members.3322.org/dyndns/getip".to_string(),
                "http://httpbin.org/ip".to_string(),
                "http://ifconfig.me/ip".to_string(),
                "http://icanhazip.com".to_string(),
            ],
            ip_timeout: Duration::from_secs(8),
            rebuild_after_failures: 3,
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Path to the tunnel binary
    pub binary: PathBuf,
    /// Directory for generated per-port config files
    pub work_dir: PathBuf,
    /// First local port; tunnel exit `i` listens on `base_port + i`
    pub base_port: u16,
    /// Number of tunnel exits to run
    pub exits: usize,
    /// Upper bound for a started process to bind its port
    pub startup_wait: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Upper bound for the port to become free after stop
    pub port_release_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("sing-box"),
            work_dir: env::temp_dir().join("egress-dispatch"),
            base_port: 21000,
            exits: 5,
            startup_wait: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(2),
            port_release_timeout: Duration::from_secs(3),
        }
    }
}

impl TunnelConfig {
    /// Port assigned to the tunnel exit in `slot` (1-based, slot 0 is direct)
    pub fn exit_port(&self, slot: usize) -> Result<u16> {
        offset_port(self.base_port, slot.saturating_sub(1))
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// JSON file holding the candidate node list
    pub nodes_file: Option<PathBuf>,
    /// How long a successful test keeps a node Verified
    pub verification_ttl: Duration,
    /// Number of dedicated test slots (parallel throwaway tunnels)
    pub test_slots: usize,
    /// Maximum idle time between replenishment passes
    pub replenish_interval: Duration,
    /// Delay before the first replenishment pass
    pub initial_delay: Duration,
    /// Untested candidates tested per missing ready node
    pub untested_batch_factor: usize,
    /// Failed candidates retried per missing ready node
    pub failed_batch_factor: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            nodes_file: None,
            verification_ttl: Duration::from_secs(300),
            test_slots: 5,
            replenish_interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(10),
            untested_batch_factor: 3,
            failed_batch_factor: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the status API (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Allowed CORS origins (empty = localhost only)
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let dispatch_defaults = DispatchConfig::default();
        let health_defaults = HealthConfig::default();
        let tunnel_defaults = TunnelConfig::default();
        let catalog_defaults = CatalogConfig::default();

        let config = Config {
            dispatch: DispatchConfig {
                login_quota: parse_env("EGRESS_LOGIN_QUOTA", dispatch_defaults.login_quota)?,
                window: secs_env("EGRESS_WINDOW_SECS", dispatch_defaults.window)?,
                freeze_duration: secs_env("EGRESS_FREEZE_SECS", dispatch_defaults.freeze_duration)?,
                throttle_ratio: ratio_env("EGRESS_THROTTLE_RATIO", dispatch_defaults.throttle_ratio)?,
                throttle_step: ratio_env("EGRESS_THROTTLE_STEP", dispatch_defaults.throttle_step)?,
                throttle_floor: parse_env("EGRESS_THROTTLE_FLOOR", dispatch_defaults.throttle_floor)?
                    .max(1),
                retry_blocked_via_direct: bool_env(
                    "EGRESS_RETRY_BLOCKED_VIA_DIRECT",
                    dispatch_defaults.retry_blocked_via_direct,
                )?,
                request_timeout: secs_env(
                    "EGRESS_REQUEST_TIMEOUT",
                    dispatch_defaults.request_timeout,
                )?,
                connect_timeout: secs_env(
                    "EGRESS_CONNECT_TIMEOUT",
                    dispatch_defaults.connect_timeout,
                )?,
            },
            health: HealthConfig {
                interval: secs_env("EGRESS_HEALTH_INTERVAL", health_defaults.interval)?,
                timeout: secs_env("EGRESS_HEALTH_TIMEOUT", health_defaults.timeout)?,
                probe_url: get_env_or("EGRESS_PROBE_URL", &health_defaults.probe_url),
                ip_services: match env::var("EGRESS_IP_SERVICES") {
                    Ok(raw) => split_list(&raw),
                    Err(_) => health_defaults.ip_services,
                },
                ip_timeout: secs_env("EGRESS_IP_TIMEOUT", health_defaults.ip_timeout)?,
                rebuild_after_failures: parse_env(
                    "EGRESS_REBUILD_AFTER_FAILURES",
                    health_defaults.rebuild_after_failures,
                )?
                .max(1),
                maintenance_interval: secs_env(
                    "EGRESS_MAINTENANCE_INTERVAL",
                    health_defaults.maintenance_interval,
                )?,
            },
            tunnel: TunnelConfig {
                binary: env::var("EGRESS_TUNNEL_BINARY")
                    .map(PathBuf::from)
                    .unwrap_or(tunnel_defaults.binary),
                work_dir: env::var("EGRESS_TUNNEL_WORK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(tunnel_defaults.work_dir),
                base_port: get_env_or("EGRESS_TUNNEL_BASE_PORT", "21000")
                    .parse()
                    .map_err(|_| {
                        EgressError::InvalidConfig(
                            "EGRESS_TUNNEL_BASE_PORT must be a valid port number".into(),
                        )
                    })?,
                exits: parse_env("EGRESS_TUNNEL_EXITS", tunnel_defaults.exits)?,
                startup_wait: secs_env("EGRESS_TUNNEL_STARTUP_WAIT", tunnel_defaults.startup_wait)?,
                stop_timeout: secs_env("EGRESS_TUNNEL_STOP_TIMEOUT", tunnel_defaults.stop_timeout)?,
                port_release_timeout: secs_env(
                    "EGRESS_TUNNEL_PORT_RELEASE_TIMEOUT",
                    tunnel_defaults.port_release_timeout,
                )?,
            },
            catalog: CatalogConfig {
                nodes_file: env::var("EGRESS_NODES_FILE")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
                verification_ttl: secs_env(
                    "EGRESS_VERIFICATION_TTL",
                    catalog_defaults.verification_ttl,
                )?,
                test_slots: parse_env("EGRESS_TEST_SLOTS", catalog_defaults.test_slots)?.max(1),
                replenish_interval: secs_env(
                    "EGRESS_REPLENISH_INTERVAL",
                    catalog_defaults.replenish_interval,
                )?,
                initial_delay: secs_env(
                    "EGRESS_REPLENISH_INITIAL_DELAY",
                    catalog_defaults.initial_delay,
                )?,
                untested_batch_factor: catalog_defaults.untested_batch_factor,
                failed_batch_factor: catalog_defaults.failed_batch_factor,
            },
            api: ApiServerConfig {
                port: get_env_or("EGRESS_API_PORT", "8001").parse().map_err(|_| {
                    EgressError::InvalidConfig("EGRESS_API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("EGRESS_API_HOST", "127.0.0.1"),
                cors_origins: env::var("EGRESS_API_CORS_ORIGINS")
                    .map(|raw| split_list(&raw))
                    .unwrap_or_default(),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check settings that only make sense together: every local port must
    /// fit in the port range and probe targets must be plain http.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.base_port == 0 {
            return Err(EgressError::InvalidConfig(
                "EGRESS_TUNNEL_BASE_PORT must be non-zero".into(),
            ));
        }
        let ports = self.tunnel.exits + self.catalog.test_slots;
        if ports > 0 {
            offset_port(self.tunnel.base_port, ports - 1).map_err(|_| {
                EgressError::InvalidConfig(format!(
                    "{} tunnel and test ports starting at {} exceed port 65535",
                    ports, self.tunnel.base_port
                ))
            })?;
        }

        check_http_url("EGRESS_PROBE_URL", &self.health.probe_url)?;
        for url in &self.health.ip_services {
            check_http_url("EGRESS_IP_SERVICES", url)?;
        }
        Ok(())
    }

    /// Get the status API address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    /// First port used by the catalog's throwaway test tunnels
    pub fn test_port_base(&self) -> Result<u16> {
        offset_port(self.tunnel.base_port, self.tunnel.exits)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            health: HealthConfig::default(),
            tunnel: TunnelConfig::default(),
            catalog: CatalogConfig::default(),
            api: ApiServerConfig {
                port: 8001,
                host: "127.0.0.1".to_string(),
                cors_origins: Vec::new(),
            },
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

fn parse_env<T: FromStr + ToString>(key: &str, default: T) -> Result<T> {
    let raw = get_env_or(key, &default.to_string());
    raw.trim()
        .parse()
        .map_err(|_| EgressError::InvalidConfig(format!("{} must be a valid number", key)))
}

fn bool_env(key: &str, default: bool) -> Result<bool> {
    let raw = get_env_or(key, &default.to_string());
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(EgressError::InvalidConfig(format!(
            "{} must be true or false",
            key
        ))),
    }
}

fn secs_env(key: &str, default: Duration) -> Result<Duration> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

fn ratio_env(key: &str, default: f64) -> Result<f64> {
    let value: f64 = parse_env(key, default)?;
    if !(value > 0.0 && value < 1.0) {
        return Err(EgressError::InvalidConfig(format!(
            "{} must be between 0 and 1 (exclusive)",
            key
        )));
    }
    Ok(value)
}

/// `base + offset`, or `InvalidConfig` past the end of the port range
pub(crate) fn offset_port(base: u16, offset: usize) -> Result<u16> {
    u16::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| {
            EgressError::InvalidConfig(format!("port {} + {} is out of range", base, offset))
        })
}

fn check_http_url(key: &str, url: &str) -> Result<()> {
    parse_http_url(url)
        .map(|_| ())
        .map_err(|e| EgressError::InvalidConfig(format!("{}: {} ({})", key, url, e)))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
