//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Broker unreachable; expected while the mesh is forming or restarting
    #[error("Could not connect: {0}")]
    CouldNotConnect(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is expected to clear up on its own
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CouldNotConnect(_) | Self::Timeout(_))
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
