//! Ironbeat daemon library.
//!
//! Exposes the daemon internals for integration testing. In production
//! `ironbeat-daemon` runs as a binary (main.rs).

pub mod checkpoint;
pub mod cli;
pub mod health;
pub mod input;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
