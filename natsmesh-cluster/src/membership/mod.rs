//! Cluster membership
//!
//! Heartbeat registry in a shared [`ConfigStore`], drift detection against the
//! canonical broker options, and reload signalling for the local broker.

pub mod heartbeat;
pub mod manager;
pub mod redis_store;
pub mod reload;
pub mod store;

pub use heartbeat::{trim_timestamp, HeartbeatResult, ServerHeartbeat};
pub use manager::{MembershipManager, MembershipSettings};
pub use redis_store::RedisConfigStore;
pub use reload::reload_configuration;
pub use store::{ConfigStore, MemoryConfigStore};
