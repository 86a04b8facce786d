//! Broker config file rendering
//!
//! Fills a fixed template with the canonical broker options and one route per
//! registered peer. Output is recomputed on every call.

use std::path::Path;

use async_trait::async_trait;
use natsmesh_core::config::NatsConfig;

use crate::error::Result;
use crate::options::route_url;

pub const LOG_DEBUG: &str = "[LOG_DEBUG]";
pub const LOG_TRACE: &str = "[LOG_TRACE]";
pub const LOGFILE: &str = "[LOGFILE]";
pub const URL: &str = "[URL]";
pub const PORT: &str = "[PORT]";
pub const MONITOR_PORT: &str = "[MONITOR_PORT]";
pub const USERNAME: &str = "[USERNAME]";
pub const PASSWORD: &str = "[PASSWORD]";
pub const CLUSTER_NAME: &str = "[CLUSTER_NAME]";
pub const ROUTES_PORT: &str = "[ROUTES_PORT]";
pub const ALL_ROUTES: &str = "[ALL_ROUTES]";

pub const PLACEHOLDERS: [&str; 11] = [
    LOG_DEBUG,
    LOG_TRACE,
    LOGFILE,
    URL,
    PORT,
    MONITOR_PORT,
    USERNAME,
    PASSWORD,
    CLUSTER_NAME,
    ROUTES_PORT,
    ALL_ROUTES,
];

/// Indentation of each generated route line
const ROUTE_INDENT: &str = "    ";

pub const TEMPLATE: &str = r#"# Generated by natsmesh; manual edits are overwritten on the next membership change.
debug: [LOG_DEBUG]
trace: [LOG_TRACE]
log_file: "[LOGFILE]"

listen: [URL]:[PORT]
http_port: [MONITOR_PORT]

authorization {
  user: "[USERNAME]"
  password: "[PASSWORD]"
}

cluster {
  name: "[CLUSTER_NAME]"
  listen: [URL]:[ROUTES_PORT]

  authorization {
    user: "[USERNAME]"
    password: "[PASSWORD]"
  }

  routes = [
[ALL_ROUTES]
  ]
}
"#;

/// Source of the registered server names
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn registered_server_names(&self) -> Vec<String>;
}

/// Render the broker config for the servers currently in `directory`
pub async fn render(
    options: &NatsConfig,
    local_server_name: &str,
    directory: &dyn ServerDirectory,
) -> String {
    let servers = directory.registered_server_names().await;
    render_with_servers(options, local_server_name, &servers)
}

/// Render the broker config for an explicit server list
///
/// The local server is left out of the routes; a node never routes to itself.
#[must_use]
pub fn render_with_servers(options: &NatsConfig, local_server_name: &str, servers: &[String]) -> String {
    let routes = servers
        .iter()
        .filter(|name| name.as_str() != local_server_name)
        .map(|name| format!("{ROUTE_INDENT}{}", route_url(options, name)))
        .collect::<Vec<_>>()
        .join("\n");

    TEMPLATE
        .replace(LOG_DEBUG, &options.debug.to_string())
        .replace(LOG_TRACE, &options.trace.to_string())
        .replace(LOGFILE, &escape_quoted(&options.log_file))
        .replace(URL, &options.listen_host)
        .replace(MONITOR_PORT, &options.monitor_port.to_string())
        .replace(ROUTES_PORT, &options.route_port.to_string())
        .replace(PORT, &options.port.to_string())
        .replace(USERNAME, &escape_quoted(&options.user))
        .replace(PASSWORD, &escape_quoted(&options.password))
        .replace(CLUSTER_NAME, &escape_quoted(&options.cluster_name))
        .replace(ALL_ROUTES, &routes)
}

/// Write `content` to `path` unless the file already holds exactly that
///
/// Returns whether the file was (re)written.
pub async fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(true)
}

/// Escape a value placed inside a double-quoted config string
fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDirectory(Vec<String>);

    #[async_trait]
    impl ServerDirectory for FixedDirectory {
        async fn registered_server_names(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    fn options() -> NatsConfig {
        NatsConfig {
            user: "mesh".to_string(),
            password: "secret".to_string(),
            port: 4222,
            cluster_name: "prod".to_string(),
            route_port: 6222,
            ..NatsConfig::default()
        }
    }

    fn route_lines<'a>(rendered: &'a str, server: &str) -> Vec<&'a str> {
        let suffix = format!("@{server}:6222");
        rendered
            .lines()
            .filter(|line| line.trim_start().starts_with("nats-route://") && line.ends_with(&suffix))
            .collect()
    }

    #[tokio::test]
    async fn test_render_routes_exclude_local() {
        let directory = FixedDirectory(vec![
            "local".to_string(),
            "node2".to_string(),
            "node3".to_string(),
        ]);

        let rendered = render(&options(), "local", &directory).await;

        for placeholder in PLACEHOLDERS {
            assert!(!rendered.contains(placeholder), "{placeholder} left in output");
        }
        assert_eq!(route_lines(&rendered, "node2").len(), 1);
        assert_eq!(route_lines(&rendered, "node3").len(), 1);
        assert!(route_lines(&rendered, "local").is_empty());
        assert!(rendered.contains("listen: 0.0.0.0:4222"));
        assert!(rendered.contains("listen: 0.0.0.0:6222"));
        assert!(rendered.contains("name: \"prod\""));
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn test_render_single_node_has_no_routes() {
        let rendered = render_with_servers(&options(), "local", &["local".to_string()]);
        assert!(!rendered.contains("nats-route://"));
        assert!(!rendered.contains(ALL_ROUTES));
    }

    #[test]
    fn test_render_log_flags_and_monitor_port() {
        let mut opts = options();
        opts.debug = true;
        opts.monitor_port = 8333;
        let rendered = render_with_servers(&opts, "local", &[]);
        assert!(rendered.contains("debug: true"));
        assert!(rendered.contains("trace: false"));
        assert!(rendered.contains("http_port: 8333"));
    }

    #[test]
    fn test_render_escapes_quotes_in_password() {
        let mut opts = options();
        opts.password = "a\"b".to_string();
        let rendered = render_with_servers(&opts, "local", &[]);
        assert!(rendered.contains("password: \"a\\\"b\""));
    }

    #[tokio::test]
    async fn test_write_if_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("nats-server.conf");

        assert!(write_if_changed(&path, "a\n").await.unwrap());
        assert!(!write_if_changed(&path, "a\n").await.unwrap());
        assert!(write_if_changed(&path, "b\n").await.unwrap());
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "b\n");
    }

    #[test]
    fn test_render_is_deterministic() {
        let servers = vec!["b".to_string(), "a".to_string()];
        assert_eq!(
            render_with_servers(&options(), "local", &servers),
            render_with_servers(&options(), "local", &servers)
        );
    }
}
