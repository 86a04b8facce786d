//! Broker connection abstraction
//!
//! The [`ConnectionManager`] works against the [`Connection`] and
//! [`ConnectionFactory`] traits; [`nats::NatsConnectionFactory`] is the
//! production implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::options::ConnectionOptions;

pub mod manager;
pub mod nats;
pub mod registry;

#[cfg(test)]
pub(crate) mod fake;

pub use manager::{ConnectionManager, ConnectionSettings};
pub use nats::NatsConnectionFactory;
pub use registry::SubscriptionRegistry;

/// Observable state of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle events raised by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Terminal; the connection will not be used again
    Closed,
    Disconnected,
    Reconnected,
    ServerDiscovered(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
}

/// Callback invoked for every message delivered to a subscription
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Handle of an active subscription
#[async_trait]
pub trait Subscription: Send + Sync {
    fn subject(&self) -> &str;

    async fn unsubscribe(&self) -> Result<()>;
}

/// One physical connection to the broker mesh
#[async_trait]
pub trait Connection: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Whether the client may reconnect on its own after losing the server
    fn set_allow_reconnect(&self, allow: bool);

    /// Receiver for this connection's lifecycle events
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Subscribe `handler` to `subject`
    ///
    /// `Ok(None)` means the client accepted the call but produced no handle.
    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<Option<Box<dyn Subscription>>>;

    /// Flush pending traffic, then close
    async fn drain(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds connections from an options snapshot
///
/// `Err(Error::CouldNotConnect)` marks an unreachable broker; any other error
/// is fatal to that attempt. `Ok(None)` means no connection could be produced.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, options: &ConnectionOptions) -> Result<Option<Arc<dyn Connection>>>;
}
