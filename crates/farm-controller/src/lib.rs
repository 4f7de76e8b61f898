//! Build farm controller daemon
//!
//! Configuration loading and the HTTP API; `main.rs` wires them to the
//! controller, the health monitor and the cluster.

pub mod api;
pub mod config;
