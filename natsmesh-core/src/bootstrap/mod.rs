//! Bootstrap helpers for the `natsmesh` daemon
//!
//! Resolves and validates configuration before any cluster component starts.

pub mod config;

pub use config::load_config;
