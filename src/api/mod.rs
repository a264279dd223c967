//! Status API
//!
//! Read-only views of exits and nodes plus two operator actions: egress IP
//! detection and forced exit rebuilds.

pub mod handlers;
mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
