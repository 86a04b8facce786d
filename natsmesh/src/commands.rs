//! One-shot subcommands

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use natsmesh_cluster::membership::store::{heartbeat_key, servers_path};
use natsmesh_cluster::membership::{reload_configuration, ServerHeartbeat};
use natsmesh_cluster::options::{server_url, sort_preferred};
use natsmesh_cluster::{render, ConfigStore, MemoryConfigStore, RedisConfigStore};
use natsmesh_core::config::{Config, StoreBackend};

/// Open the configured membership store
pub async fn open_store(config: &Config) -> Result<Arc<dyn ConfigStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory membership store (single node)");
            Ok(Arc::new(MemoryConfigStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisConfigStore::connect(
                &config.store.redis_url,
                &config.store.key_prefix,
                Duration::from_secs(config.store.timeout_seconds),
            )
            .await
            .context("Failed to open Redis membership store")?;
            Ok(Arc::new(store))
        }
    }
}

async fn registered_servers(config: &Config, store: &dyn ConfigStore) -> Result<Vec<String>> {
    store
        .children(&servers_path(&config.node.root))
        .await
        .context("Failed to enumerate registered servers")
}

pub async fn render(config: &Config, output: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let servers = registered_servers(config, store.as_ref()).await?;
    let rendered = render::render_with_servers(&config.nats, &config.node.server_name, &servers);

    match output {
        Some(path) => {
            let written = render::write_if_changed(Path::new(path), &rendered)
                .await
                .with_context(|| format!("Failed to write {path}"))?;
            info!(path = %path, written, "Broker configuration rendered");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

pub async fn reload(config: &Config) -> Result<()> {
    let reloaded = reload_configuration(
        &config.nats.broker_binary,
        &config.nats.component_name,
        Duration::from_secs(config.nats.reload_timeout_seconds),
    )
    .await;

    if !reloaded {
        anyhow::bail!("Broker reload failed");
    }
    Ok(())
}

pub async fn servers(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let names = registered_servers(config, store.as_ref()).await?;

    let by_url: HashMap<String, String> = names
        .into_iter()
        .map(|name| (server_url(&name, config.nats.port), name))
        .collect();
    let mut urls: Vec<String> = by_url.keys().cloned().collect();
    sort_preferred(&mut urls, &server_url(&config.node.server_name, config.nats.port));

    for (url, name) in urls.iter().filter_map(|url| by_url.get(url).map(|name| (url, name))) {
        let key = heartbeat_key(&config.node.root, name);
        let last_seen = store
            .get(&key)
            .await
            .with_context(|| format!("Failed to read heartbeat of {name}"))?
            .as_deref()
            .and_then(|raw| ServerHeartbeat::parse(name.as_str(), raw))
            .map_or_else(|| "-".to_string(), |hb| hb.timestamp.to_rfc3339());
        println!("{url}\t{last_seen}");
    }
    Ok(())
}
