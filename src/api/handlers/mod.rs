//! API request handlers

pub mod exits;
pub mod health;
pub mod nodes;
