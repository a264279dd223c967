//! Egress Dispatch - outbound egress dispatcher
//!
//! Sends outbound HTTP requests through a direct path or one of several
//! managed proxy tunnels.
//!
//! ## Features
//!
//! - Least-active exit selection with per-exit login quotas
//! - Freeze and adaptive throttling on 403/429, with a one-shot direct retry
//! - Periodic health probing and egress IP detection
//! - Tunnel processes managed per local port, rebuilt in place when they fail
//! - Tiered node catalog with a hot-standby pool of verified nodes
//! - Status API

pub mod api;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod exit;
pub mod forward;
pub mod health;
pub mod models;
pub mod service;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use error::{EgressError, Result};
pub use service::EgressService;
