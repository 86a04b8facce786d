//! Configuration loading

use anyhow::Result;
use std::path::Path;

use crate::Config;

/// Environment variable holding an explicit config file path
pub const CONFIG_PATH_ENV: &str = "NATSMESH_CONFIG_PATH";

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. `explicit` (usually the `--config` CLI flag)
/// 2. `NATSMESH_CONFIG_PATH` environment variable
/// 3. ./natsmesh.yaml (current working directory)
/// 4. /config/natsmesh.yaml (Kubernetes mount path)
/// 5. Fall back to environment variables only
///
/// A path named by 1 or 2 must exist.
///
/// Runs before logging is initialized, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config = match resolve_config_path(explicit)? {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env().unwrap_or_else(|e| {
                eprintln!("Failed to load config from environment: {e}");
                eprintln!("Using default configuration");
                Config::default()
            })
        }
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

fn resolve_config_path(explicit: Option<&str>) -> Result<Option<String>> {
    let requested = explicit
        .map(ToString::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok());

    if let Some(path) = requested {
        if !Path::new(&path).exists() {
            anyhow::bail!("Config file {path} does not exist");
        }
        return Ok(Some(path));
    }

    Ok(["natsmesh.yaml", "/config/natsmesh.yaml"]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .map(ToString::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_path_wins() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "nats:\n  port: 4333").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        assert_eq!(resolve_config_path(Some(&path)).unwrap(), Some(path.clone()));

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.nats.port, 4333);
        assert_eq!(config.nats.route_port, 6222);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let path = path.to_str().unwrap();

        let err = load_config(Some(path)).unwrap_err();
        assert!(err.to_string().contains("does not exist"), "unexpected error: {err}");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "nats:\n  port: 6222\n  route_port: 6222").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }
}
