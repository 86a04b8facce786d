//! Broker mesh coordination
//!
//! [`MembershipManager`] keeps the shared server registry and produces option
//! snapshots; [`ConnectionManager`] keeps this process connected to the mesh
//! according to those snapshots.

pub mod connection;
pub mod error;
pub mod membership;
pub mod options;
pub mod render;

pub use connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionManager, ConnectionSettings, ConnectionState, Message,
    MessageHandler, NatsConnectionFactory, Subscription,
};
pub use error::{Error, Result};
pub use membership::{ConfigStore, MembershipManager, MembershipSettings, MemoryConfigStore, RedisConfigStore};
pub use options::{ConnectionOptions, OptionsChanged, OptionsDrift};
