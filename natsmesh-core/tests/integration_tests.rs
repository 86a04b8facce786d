//! Integration tests for natsmesh-core configuration loading
//!
//! Run with: cargo test --test integration_tests

use std::io::Write;

use natsmesh_core::config::{Config, StoreBackend};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    file.write_all(contents.as_bytes())
        .expect("Failed to write temp config");
    file
}

#[test]
fn test_full_config_file() {
    let file = write_config(
        r#"
node:
  server_name: node-a
  root: mesh
nats:
  user: broker
  password: "p@ss word"
  port: 4300
  route_port: 6300
  cluster_name: prod
  debug: true
  config_file_path: /etc/nats/nats.conf
membership:
  polling_interval_seconds: 10
  outdated_after_seconds: 120
connection:
  subscribe_retry_limit: 3
store:
  backend: redis
  redis_url: redis://cache:6379
  key_prefix: "prod:"
logging:
  level: debug
  format: json
"#,
    );

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.node.server_name, "node-a");
    assert_eq!(config.node.root, "mesh");
    assert_eq!(config.nats.user, "broker");
    assert_eq!(config.nats.password, "p@ss word");
    assert_eq!(config.nats.port, 4300);
    assert_eq!(config.nats.route_port, 6300);
    assert_eq!(config.nats.monitor_port, 8222);
    assert!(config.nats.debug);
    assert!(!config.nats.trace);
    assert_eq!(
        config.nats.config_file_path.as_deref(),
        Some("/etc/nats/nats.conf")
    );
    assert_eq!(config.membership.polling_interval_seconds, 10);
    assert_eq!(config.membership.heartbeat_granularity_seconds, 1);
    assert_eq!(config.connection.subscribe_retry_limit, 3);
    assert_eq!(config.store.backend, StoreBackend::Redis);
    assert_eq!(config.store.key_prefix, "prod:");
    assert_eq!(config.logging.format, "json");
    assert!(config.validate().is_ok());
}

#[test]
fn test_environment_overrides_file() {
    let file = write_config("nats:\n  component_name: from-file\n");

    // Only this test touches this variable; tests run in parallel.
    std::env::set_var("NATSMESH_NATS__COMPONENT_NAME", "from-env");
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    std::env::remove_var("NATSMESH_NATS__COMPONENT_NAME");

    assert_eq!(config.nats.component_name, "from-env");
}

#[test]
fn test_missing_file_uses_defaults() {
    let config = Config::from_file("/nonexistent/natsmesh.yaml").unwrap();
    assert_eq!(config.nats.port, 4222);
    assert_eq!(config.store.backend, StoreBackend::Memory);
}
