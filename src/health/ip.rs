//! Egress IP detection via "what is my IP" services

use std::net::IpAddr;
use std::time::Duration;

use tracing::debug;

use crate::transport;

/// Queries IP services in order and returns the first usable answer
#[derive(Debug, Clone)]
pub struct IpDetector {
    services: Vec<String>,
    timeout: Duration,
}

impl IpDetector {
    pub fn new(services: Vec<String>, timeout: Duration) -> Self {
        Self { services, timeout }
    }

    /// Detect the public address seen through `socks_port` (or directly)
    pub async fn detect(&self, socks_port: Option<u16>) -> Option<IpAddr> {
        for service in &self.services {
            match transport::get(socks_port, service, self.timeout).await {
                Ok(resp) if resp.status.is_success() => match parse_ip_response(&resp.body) {
                    Some(ip) => return Some(ip),
                    None => debug!(service = %service, "IP service returned no address"),
                },
                Ok(resp) => debug!(service = %service, status = resp.status.as_u16(), "IP service failed"),
                Err(e) => debug!(service = %service, "IP service unreachable: {}", e),
            }
        }
        None
    }
}

/// Extract an address from a plain-text or JSON (`origin`/`ip`) answer.
/// For comma separated lists the first entry wins.
pub fn parse_ip_response(body: &[u8]) -> Option<IpAddr> {
    let text = std::str::from_utf8(body).ok()?.trim();

    if text.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let raw = ["origin", "ip", "query"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()))?;
        return first_address(raw);
    }

    first_address(text.lines().next().unwrap_or_default())
}

fn first_address(raw: &str) -> Option<IpAddr> {
    raw.split(',').next()?.trim().parse().ok()
}
