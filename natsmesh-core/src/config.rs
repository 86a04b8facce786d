use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub nats: NatsConfig,
    pub membership: MembershipConfig,
    pub connection: ConnectionConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Identity of this process inside the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name this node registers under; also the host part of its broker URL
    pub server_name: String,
    /// Root section of every key written to the configuration store
    pub root: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            root: "natsmesh".to_string(),
        }
    }
}

fn default_server_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Canonical broker options.
///
/// These values are the source of truth for both the rendered broker config
/// file and the client connection options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub user: String,
    pub password: String,
    pub listen_host: String,
    pub port: u16,
    pub monitor_port: u16,
    pub cluster_name: String,
    pub route_port: u16,
    pub log_file: String,
    pub debug: bool,
    pub trace: bool,
    /// Broker executable used for the reload signal
    pub broker_binary: String,
    /// Component name passed as `--signal reload=<component_name>`
    pub component_name: String,
    /// Where the rendered broker config is written; rendering is skipped when unset
    pub config_file_path: Option<String>,
    pub reload_timeout_seconds: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            user: "natsmesh".to_string(),
            password: String::new(),
            listen_host: "0.0.0.0".to_string(),
            port: 4222,
            monitor_port: 8222,
            cluster_name: "natsmesh".to_string(),
            route_port: 6222,
            log_file: "./logs/nats-server.log".to_string(),
            debug: false,
            trace: false,
            broker_binary: "nats-server".to_string(),
            component_name: "nats-server".to_string(),
            config_file_path: None,
            reload_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub polling_interval_seconds: u64,
    pub heartbeat_granularity_seconds: u64,
    /// Servers whose last heartbeat is older than this are removed from the registry
    pub outdated_after_seconds: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            polling_interval_seconds: 30,
            heartbeat_granularity_seconds: 1,
            outdated_after_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub subscribe_retry_limit: u32,
    pub subscribe_retry_delay_ms: u64,
    pub connect_timeout_seconds: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            subscribe_retry_limit: 10,
            subscribe_retry_delay_ms: 100,
            connect_timeout_seconds: 5,
        }
    }
}

/// Backend of the heartbeat registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map, for single-node deployments
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    pub timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: String::new(),
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // NATSMESH_NATS__PORT, NATSMESH_STORE__BACKEND, ...
        builder = builder.add_source(
            Environment::with_prefix("NATSMESH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration for values the cluster components cannot work with.
    ///
    /// Every problem is reported, not only the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.server_name.trim().is_empty() {
            errors.push("node.server_name must not be empty".to_string());
        }
        if self.node.server_name.contains(':') {
            errors.push("node.server_name must not contain ':'".to_string());
        }
        if self.node.root.trim().is_empty() {
            errors.push("node.root must not be empty".to_string());
        }
        if self.nats.port == 0 {
            errors.push("nats.port must be non-zero".to_string());
        }
        if self.nats.route_port == 0 {
            errors.push("nats.route_port must be non-zero".to_string());
        }
        if self.nats.port == self.nats.route_port {
            errors.push("nats.port and nats.route_port must differ".to_string());
        }
        if self.nats.cluster_name.trim().is_empty() {
            errors.push("nats.cluster_name must not be empty".to_string());
        }
        if self.membership.polling_interval_seconds == 0 {
            errors.push("membership.polling_interval_seconds must be non-zero".to_string());
        }
        if self.membership.heartbeat_granularity_seconds == 0 {
            errors.push("membership.heartbeat_granularity_seconds must be non-zero".to_string());
        }
        if self.membership.outdated_after_seconds <= self.membership.polling_interval_seconds {
            errors.push(format!(
                "membership.outdated_after_seconds ({}) must exceed the polling interval ({})",
                self.membership.outdated_after_seconds, self.membership.polling_interval_seconds
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            errors.push("store.redis_url is required for the redis backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Client URL of the local broker
    #[must_use]
    pub fn local_server_url(&self) -> String {
        format!("nats://{}:{}", self.node.server_name, self.nats.port)
    }
}
