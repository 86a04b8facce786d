//! Long-running mesh member

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use natsmesh_cluster::{
    ConnectionManager, ConnectionSettings, MembershipManager, MembershipSettings, NatsConnectionFactory,
};
use natsmesh_core::{bootstrap::load_config, Config};

use crate::commands::open_store;

/// Run until Ctrl+C or SIGTERM; SIGHUP re-reads the broker options
pub async fn run(config: Config, config_path: Option<String>) -> Result<()> {
    info!(
        server_name = %config.node.server_name,
        url = %config.local_server_url(),
        root = %config.node.root,
        cluster = %config.nats.cluster_name,
        "natsmesh starting"
    );

    let store = open_store(&config).await?;
    let (canonical_tx, canonical_rx) = watch::channel(Arc::new(config.nats.clone()));

    let membership = MembershipManager::start(MembershipSettings::from_config(&config), store, canonical_rx).await?;

    let connections = ConnectionManager::new(
        Arc::new(NatsConnectionFactory::from_config(&config.connection)),
        ConnectionSettings::from_config(&config.connection),
        membership.connection_options(),
        membership.subscribe_options_changed(),
    );

    // The manager is subscribed now, so the first snapshot reaches it.
    membership.synchronize().await;

    let mut hangup = Hangup::new()?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            () = hangup.recv() => {
                info!("Received SIGHUP, reloading broker options");
                match load_config(config_path.as_deref()) {
                    Ok(reloaded) => {
                        if reloaded.node.server_name != config.node.server_name || reloaded.node.root != config.node.root {
                            warn!("Node identity changes need a restart and were ignored");
                        }
                        canonical_tx.send_replace(Arc::new(reloaded.nats));
                    }
                    Err(e) => error!("Failed to reload configuration: {e:#}"),
                }
            }
        }
    }

    info!("Shutting down");
    connections.dispose().await;
    membership.shutdown();
    info!("natsmesh stopped");
    Ok(())
}

#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn new() -> std::io::Result<Self> {
        let signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        Ok(Self(Some(signal)))
    }

    async fn recv(&mut self) {
        let Some(signal) = self.0.as_mut() else {
            return std::future::pending().await;
        };
        if signal.recv().await.is_none() {
            self.0 = None;
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    #[allow(clippy::unnecessary_wraps)]
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
