//! Server membership and broker configuration manager
//!
//! Keeps this node's heartbeat fresh in the shared store, evicts members whose
//! heartbeat went stale, and turns registry or option changes into a new
//! [`ConnectionOptions`] snapshot, a rendered broker config and a reload signal.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use natsmesh_core::config::{Config, NatsConfig};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::heartbeat::{trim_timestamp, HeartbeatResult, ServerHeartbeat};
use super::reload;
use super::store::{heartbeat_key, server_path, servers_path, ConfigStore};
use crate::error::{Error, Result};
use crate::options::{server_url, sort_preferred, ConnectionOptions, OptionsChanged, OptionsDrift};
use crate::render::{self, ServerDirectory};

/// Capacity of the `OptionsChanged` broadcast channel
const OPTIONS_CHANNEL_CAPACITY: usize = 16;

/// Fixed settings of the membership loop
#[derive(Debug, Clone)]
pub struct MembershipSettings {
    pub server_name: String,
    /// Key root in the configuration store
    pub root: String,
    pub polling_interval: Duration,
    pub heartbeat_granularity: Duration,
    /// Members whose heartbeat is older than this are removed
    pub outdated_after: Duration,
}

impl MembershipSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_name: config.node.server_name.clone(),
            root: config.node.root.clone(),
            polling_interval: Duration::from_secs(config.membership.polling_interval_seconds),
            heartbeat_granularity: Duration::from_secs(config.membership.heartbeat_granularity_seconds),
            outdated_after: Duration::from_secs(config.membership.outdated_after_seconds),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(Error::Configuration("server name must not be empty".to_string()));
        }
        if self.server_name.contains(super::store::KEY_SEPARATOR) {
            return Err(Error::Configuration(format!(
                "server name '{}' must not contain '{}'",
                self.server_name,
                super::store::KEY_SEPARATOR
            )));
        }
        if self.root.trim().is_empty() {
            return Err(Error::Configuration("store root must not be empty".to_string()));
        }
        if self.polling_interval.is_zero() {
            return Err(Error::Configuration("polling interval must be positive".to_string()));
        }
        Ok(())
    }
}

pub struct MembershipManager {
    settings: MembershipSettings,
    store: Arc<dyn ConfigStore>,
    canonical: watch::Receiver<Arc<NatsConfig>>,
    /// Snapshot last handed to the connection manager
    live: RwLock<Arc<ConnectionOptions>>,
    /// Admits one synchronization pass at a time
    sync_lock: Mutex<()>,
    /// The broker has not yet loaded a config rendered from `live`
    broker_config_pending: AtomicBool,
    options_tx: broadcast::Sender<OptionsChanged>,
    cancel_token: CancellationToken,
}

impl MembershipManager {
    /// Register the local server and start the polling loop
    ///
    /// The loop runs a synchronization pass on every polling tick and whenever
    /// a new canonical [`NatsConfig`] is published on `canonical`. The first tick
    /// fires one polling interval after start; call [`Self::synchronize`] to run
    /// a pass right away.
    pub async fn start(
        settings: MembershipSettings,
        store: Arc<dyn ConfigStore>,
        canonical: watch::Receiver<Arc<NatsConfig>>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let (options_tx, _) = broadcast::channel(OPTIONS_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            settings,
            store,
            canonical,
            live: RwLock::new(Arc::new(ConnectionOptions::default())),
            sync_lock: Mutex::new(()),
            broker_config_pending: AtomicBool::new(false),
            options_tx,
            cancel_token: CancellationToken::new(),
        });

        let registration = manager.update_timestamp(Utc::now()).await;
        tracing::info!(
            server_name = %manager.settings.server_name,
            registered = registration.updated,
            is_new_server = registration.is_new_server,
            "Membership manager started"
        );

        tokio::spawn(Self::run(
            Arc::downgrade(&manager),
            manager.canonical.clone(),
            manager.cancel_token.clone(),
            manager.settings.polling_interval,
        ));

        Ok(manager)
    }

    async fn run(
        manager: Weak<Self>,
        mut canonical: watch::Receiver<Arc<NatsConfig>>,
        cancel_token: CancellationToken,
        polling_interval: Duration,
    ) {
        let mut timer = interval_at(Instant::now() + polling_interval, polling_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut canonical_open = true;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    tracing::info!("Membership loop shutting down");
                    return;
                }
                _ = timer.tick() => {}
                changed = canonical.changed(), if canonical_open => {
                    if changed.is_err() {
                        tracing::warn!("Canonical options source closed, continuing on the polling timer only");
                        canonical_open = false;
                        continue;
                    }
                    tracing::info!("Canonical broker options changed");
                }
            }

            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.synchronize().await;
        }
    }

    /// One synchronization pass
    ///
    /// Refreshes the local heartbeat, sweeps outdated members and, on drift,
    /// installs and broadcasts the canonical snapshot. When a broker config
    /// file is configured it is re-rendered, written if it changed, and the
    /// broker is asked to reload. A failed write or reload is retried on the
    /// next pass even when nothing drifted since.
    pub async fn synchronize(&self) -> OptionsDrift {
        let _guard = self.sync_lock.lock().await;

        let now = Utc::now();
        self.update_timestamp(now).await;
        let threshold = chrono::Duration::from_std(self.settings.outdated_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.check_for_and_remove_outdated_servers(threshold).await;

        let drift = self.is_options_changed().await;
        if drift.any() {
            self.sync_options().await;
            self.broker_config_pending.store(true, Ordering::SeqCst);
        } else {
            tracing::debug!("Connection options in sync");
        }

        if self.broker_config_pending.load(Ordering::SeqCst) && self.apply_broker_config().await {
            self.broker_config_pending.store(false, Ordering::SeqCst);
        }

        drift
    }

    /// Whether the broker still has to pick up the current options
    #[must_use]
    pub fn is_broker_config_pending(&self) -> bool {
        self.broker_config_pending.load(Ordering::SeqCst)
    }

    /// Write the rendered config and have the broker reload it
    ///
    /// True when there is no config file to maintain.
    async fn apply_broker_config(&self) -> bool {
        let nats = self.canonical_config();
        let Some(path) = nats.config_file_path.as_deref() else {
            return true;
        };

        let rendered = self.render_config().await;
        match render::write_if_changed(Path::new(path), &rendered).await {
            Ok(written) => {
                tracing::info!(path = %path, written, "Broker configuration rendered");
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Failed to write broker configuration, retrying next pass");
                return false;
            }
        }

        let reloaded = self.reload_configuration().await;
        if !reloaded {
            tracing::warn!("Broker reload failed, retrying next pass");
        }
        reloaded
    }

    /// Write the local heartbeat
    ///
    /// A stored heartbeat newer than `proposed` wins and nothing is written.
    /// Otherwise the current time, truncated to the heartbeat granularity, is
    /// stored.
    pub async fn update_timestamp(&self, proposed: DateTime<Utc>) -> HeartbeatResult {
        let server_name = &self.settings.server_name;
        let key = heartbeat_key(&self.settings.root, server_name);

        let stored = match self.store.get(&key).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(server_name = %server_name, key = %key, error = %e, "Failed to read heartbeat");
                return HeartbeatResult::default();
            }
        };
        let is_new_server = stored.is_none();

        let proposed = trim_timestamp(proposed, self.settings.heartbeat_granularity);
        if let Some(previous) = stored.as_deref().and_then(|raw| ServerHeartbeat::parse(server_name.as_str(), raw)) {
            if previous.timestamp > proposed {
                tracing::debug!(
                    server_name = %server_name,
                    stored = %previous.timestamp,
                    proposed = %proposed,
                    "Stored heartbeat is newer, skipping update"
                );
                return HeartbeatResult { updated: false, is_new_server };
            }
        }

        let heartbeat = ServerHeartbeat::new(server_name.as_str(), Utc::now(), self.settings.heartbeat_granularity);
        if let Err(e) = self.store.set(&key, &heartbeat.to_stored()).await {
            tracing::error!(server_name = %server_name, key = %key, error = %e, "Failed to write heartbeat");
            return HeartbeatResult { updated: false, is_new_server };
        }

        if is_new_server {
            tracing::info!(server_name = %server_name, "Registered new server");
        }
        HeartbeatResult { updated: true, is_new_server }
    }

    /// Remove every member whose heartbeat is at or before `threshold`
    ///
    /// A missing or unreadable heartbeat counts as infinitely old. Returns
    /// whether at least one member was removed.
    pub async fn check_for_and_remove_outdated_servers(&self, threshold: DateTime<Utc>) -> bool {
        let mut removed = false;

        for server_name in self.get_registered_server_names().await {
            let key = heartbeat_key(&self.settings.root, &server_name);
            let last_seen = match self.store.get(&key).await {
                Ok(raw) => raw
                    .as_deref()
                    .and_then(|raw| ServerHeartbeat::parse(server_name.as_str(), raw))
                    .map_or(DateTime::<Utc>::MIN_UTC, |hb| hb.timestamp),
                Err(e) => {
                    tracing::warn!(server_name = %server_name, key = %key, error = %e, "Failed to read heartbeat, skipping");
                    continue;
                }
            };

            if last_seen > threshold {
                continue;
            }

            match self.store.delete(&server_path(&self.settings.root, &server_name)).await {
                Ok(()) => {
                    tracing::info!(server_name = %server_name, last_seen = %last_seen, "Removed outdated server");
                    removed = true;
                }
                Err(e) => {
                    tracing::error!(server_name = %server_name, error = %e, "Failed to remove outdated server");
                }
            }
        }

        removed
    }

    /// Names of the registered members; empty when none or on store errors
    pub async fn get_registered_server_names(&self) -> Vec<String> {
        let path = servers_path(&self.settings.root);
        match self.store.children(&path).await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Failed to enumerate registered servers");
                Vec::new()
            }
        }
    }

    /// Client URLs of all members, the local server first, the rest sorted
    pub async fn get_registered_server_names_in_preferred_order(&self, port: u16) -> Vec<String> {
        let local = server_url(&self.settings.server_name, port);
        let mut urls: Vec<String> = self
            .get_registered_server_names()
            .await
            .iter()
            .map(|name| server_url(name, port))
            .collect();

        sort_preferred(&mut urls, &local);
        urls
    }

    /// Stored heartbeat of `server_name`, if present and readable
    pub async fn heartbeat_of(&self, server_name: &str) -> Option<ServerHeartbeat> {
        let key = heartbeat_key(&self.settings.root, server_name);
        match self.store.get(&key).await {
            Ok(raw) => raw.as_deref().and_then(|raw| ServerHeartbeat::parse(server_name, raw)),
            Err(e) => {
                tracing::warn!(server_name = %server_name, error = %e, "Failed to read heartbeat");
                None
            }
        }
    }

    /// Compare the live snapshot against the canonical options
    pub async fn is_options_changed(&self) -> OptionsDrift {
        let canonical = self.canonical_options().await;
        self.live.read().drift(&canonical)
    }

    /// Install the canonical snapshot and broadcast it
    pub async fn sync_options(&self) -> OptionsDrift {
        let canonical = Arc::new(self.canonical_options().await);
        let drift = {
            let mut live = self.live.write();
            let drift = live.drift(&canonical);
            *live = Arc::clone(&canonical);
            drift
        };

        let event = OptionsChanged {
            options: canonical,
            new_connection_needed: drift.requires_new_connection(),
        };
        tracing::info!(
            servers = ?event.options.servers,
            new_connection_needed = event.new_connection_needed,
            "Connection options synchronized"
        );
        if self.options_tx.send(event).is_err() {
            tracing::debug!("No subscribers for connection option changes");
        }

        drift
    }

    /// Signal the local broker to re-read its config file
    pub async fn reload_configuration(&self) -> bool {
        let nats = self.canonical_config();
        reload::reload_configuration(
            &nats.broker_binary,
            &nats.component_name,
            Duration::from_secs(nats.reload_timeout_seconds),
        )
        .await
    }

    /// Broker config for the current registry
    pub async fn render_config(&self) -> String {
        let nats = self.canonical_config();
        render::render(&nats, &self.settings.server_name, self).await
    }

    /// Render the broker config and write it to the configured path
    ///
    /// Returns whether the file changed; `false` when no path is configured
    /// or the write failed.
    pub async fn write_config_file(&self) -> bool {
        let nats = self.canonical_config();
        let Some(path) = nats.config_file_path.as_deref() else {
            return false;
        };

        let rendered = self.render_config().await;
        match render::write_if_changed(Path::new(path), &rendered).await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Failed to write broker configuration");
                false
            }
        }
    }

    /// Snapshot most recently installed by [`Self::sync_options`]
    #[must_use]
    pub fn connection_options(&self) -> Arc<ConnectionOptions> {
        Arc::clone(&*self.live.read())
    }

    #[must_use]
    pub fn subscribe_options_changed(&self) -> broadcast::Receiver<OptionsChanged> {
        self.options_tx.subscribe()
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.settings.server_name
    }

    /// Stop the polling loop
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    fn canonical_config(&self) -> Arc<NatsConfig> {
        Arc::clone(&*self.canonical.borrow())
    }

    async fn canonical_options(&self) -> ConnectionOptions {
        let nats = self.canonical_config();
        let servers = self.get_registered_server_names_in_preferred_order(nats.port).await;
        ConnectionOptions::from_canonical(&nats, servers)
    }
}

#[async_trait]
impl ServerDirectory for MembershipManager {
    async fn registered_server_names(&self) -> Vec<String> {
        self.get_registered_server_names().await
    }
}

impl Drop for MembershipManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
