//! Connection manager
//!
//! Owns the single live broker connection. Option changes from the membership
//! manager and lifecycle events of every tracked connection are funnelled into
//! one coordinator task; swaps of the current connection happen under a single
//! lock so there is only ever one writer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use natsmesh_core::config::ConnectionConfig;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::registry::SubscriptionRegistry;
use super::{Connection, ConnectionEvent, ConnectionFactory, ConnectionState, MessageHandler, Subscription};
use crate::error::Error;
use crate::options::{ConnectionOptions, OptionsChanged};

/// Capacity of the connection-changed broadcast channel
const CHANGED_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Failed subscribe attempts tolerated before giving up
    pub subscribe_retry_limit: u32,
    pub subscribe_retry_delay: Duration,
}

impl ConnectionSettings {
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            subscribe_retry_limit: config.subscribe_retry_limit,
            subscribe_retry_delay: Duration::from_millis(config.subscribe_retry_delay_ms),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

#[derive(Clone)]
struct Active {
    generation: u64,
    connection: Arc<dyn Connection>,
}

struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    settings: ConnectionSettings,
    /// Snapshot the next connection is built from
    options: RwLock<Arc<ConnectionOptions>>,
    current: RwLock<Option<Active>>,
    /// Superseded connections waiting for their `Closed` event
    retired: DashMap<u64, Arc<dyn Connection>>,
    registry: SubscriptionRegistry,
    last_generation: AtomicU64,
    swap_lock: Mutex<()>,
    disposed: AtomicBool,
    cancel_token: CancellationToken,
    events_tx: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
    changed_tx: broadcast::Sender<u64>,
}

pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create the manager and start its coordinator
    ///
    /// No connection is made until the first [`OptionsChanged`] arrives on
    /// `options_changed` or [`Self::create_connection`] is called.
    #[must_use]
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        settings: ConnectionSettings,
        initial_options: Arc<ConnectionOptions>,
        options_changed: broadcast::Receiver<OptionsChanged>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (changed_tx, _) = broadcast::channel(CHANGED_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            factory,
            settings,
            options: RwLock::new(initial_options),
            current: RwLock::new(None),
            retired: DashMap::new(),
            registry: SubscriptionRegistry::new(),
            last_generation: AtomicU64::new(0),
            swap_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            events_tx,
            changed_tx,
        });

        tokio::spawn(Inner::coordinate(
            Arc::downgrade(&inner),
            inner.cancel_token.clone(),
            options_changed,
            events_rx,
        ));

        Self { inner }
    }

    /// True iff the current connection is in the `Connected` state
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected().is_some()
    }

    /// Publish `payload` on `subject`; `false` when not connected or on failure
    pub async fn try_publish(&self, subject: &str, payload: Bytes) -> bool {
        let Some(active) = self.inner.connected() else {
            tracing::debug!(subject = %subject, "Not connected, message not published");
            return false;
        };

        match active.connection.publish(subject, payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(subject = %subject, generation = active.generation, error = %e, "Failed to publish message");
                false
            }
        }
    }

    /// Subscribe `handler` to `subject` on behalf of `receiver_id`
    ///
    /// Returns whether the receiver holds a subscription to `subject` on the
    /// current connection afterwards. Failed attempts, including ones that
    /// produced no handle, are retried up to the configured limit.
    pub async fn try_subscribe(&self, subject: &str, handler: MessageHandler, receiver_id: &str) -> bool {
        let limit = self.inner.settings.subscribe_retry_limit;
        let mut retries: u32 = 0;

        loop {
            let Some(active) = self.inner.connected() else {
                tracing::warn!(subject = %subject, receiver_id = %receiver_id, "Not connected, subscription abandoned");
                return false;
            };

            if self.inner.registry.contains(active.generation, receiver_id, subject) {
                tracing::info!(
                    subject = %subject,
                    receiver_id = %receiver_id,
                    generation = active.generation,
                    "Already subscribed"
                );
                return true;
            }

            match active.connection.subscribe(subject, Arc::clone(&handler)).await {
                Ok(Some(subscription)) => {
                    match self.inner.registry.insert(active.generation, receiver_id, subscription) {
                        Ok(()) => {
                            tracing::debug!(
                                subject = %subject,
                                receiver_id = %receiver_id,
                                generation = active.generation,
                                "Subscribed"
                            );
                            return true;
                        }
                        Err(subscription) => {
                            release(subscription.as_ref()).await;
                            if self.inner.registry.contains(active.generation, receiver_id, subject) {
                                tracing::info!(subject = %subject, receiver_id = %receiver_id, "Already subscribed");
                                return true;
                            }
                            tracing::warn!(
                                subject = %subject,
                                generation = active.generation,
                                "Connection retired while subscribing"
                            );
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(subject = %subject, retries, "Subscribe returned no handle");
                }
                Err(e) => {
                    tracing::warn!(subject = %subject, retries, error = %e, "Subscribe failed");
                }
            }

            retries += 1;
            if retries > limit {
                tracing::error!(
                    subject = %subject,
                    receiver_id = %receiver_id,
                    retry_limit = limit,
                    "Subscribe retry limit exceeded, giving up"
                );
                return false;
            }

            if !self.inner.settings.subscribe_retry_delay.is_zero() {
                tokio::time::sleep(self.inner.settings.subscribe_retry_delay).await;
            }
        }
    }

    /// Drop every subscription of `receiver_id` in every tracked generation
    ///
    /// Returns how many subscriptions were removed.
    pub async fn unsubscribe(&self, receiver_id: &str) -> usize {
        let removed = self.inner.registry.remove_receiver(receiver_id);
        for subscription in &removed {
            release(subscription.as_ref()).await;
        }

        tracing::debug!(receiver_id = %receiver_id, removed = removed.len(), "Receiver unsubscribed");
        removed.len()
    }

    /// Apply an options snapshot, replacing the connection when required
    pub async fn apply_options_changed(&self, event: OptionsChanged) {
        self.inner.on_options_changed(event).await;
    }

    /// Build a connection from the current snapshot and swap it in
    pub async fn create_connection(&self) {
        self.inner.create_connection().await;
    }

    /// Receiver of new generation numbers, one per successful swap
    ///
    /// Subscriptions belong to a generation; receivers re-subscribe when a
    /// new one is announced.
    #[must_use]
    pub fn subscribe_connection_changed(&self) -> broadcast::Receiver<u64> {
        self.inner.changed_tx.subscribe()
    }

    #[must_use]
    pub fn current_generation(&self) -> Option<u64> {
        self.inner.current.read().as_ref().map(|active| active.generation)
    }

    #[must_use]
    pub fn connection_options(&self) -> Arc<ConnectionOptions> {
        Arc::clone(&*self.inner.options.read())
    }

    #[must_use]
    pub fn subscription_count(&self, receiver_id: &str) -> usize {
        self.inner.registry.receiver_count(receiver_id)
    }

    #[must_use]
    pub fn tracked_generations(&self) -> Vec<u64> {
        self.inner.registry.generations()
    }

    /// Stop reacting to events, then close every connection
    ///
    /// Safe to call more than once and from several tasks.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }

    #[cfg(test)]
    pub(crate) fn retired_generations(&self) -> Vec<u64> {
        let mut generations: Vec<u64> = self.inner.retired.iter().map(|entry| *entry.key()).collect();
        generations.sort_unstable();
        generations
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.cancel_token.cancel();
    }
}

impl Inner {
    async fn coordinate(
        inner: Weak<Self>,
        cancel_token: CancellationToken,
        mut options_changed: broadcast::Receiver<OptionsChanged>,
        mut events_rx: mpsc::UnboundedReceiver<(u64, ConnectionEvent)>,
    ) {
        let mut options_open = true;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    tracing::debug!("Connection coordinator stopped");
                    return;
                }
                received = options_changed.recv(), if options_open => {
                    let event = match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Missed connection option changes");
                            continue;
                        }
                        Err(RecvError::Closed) => {
                            tracing::info!("Connection option source closed");
                            options_open = false;
                            continue;
                        }
                    };
                    let Some(inner) = inner.upgrade() else { return };
                    inner.on_options_changed(event).await;
                }
                Some((generation, event)) = events_rx.recv() => {
                    let Some(inner) = inner.upgrade() else { return };
                    inner.on_connection_event(generation, event).await;
                }
            }
        }
    }

    fn connected(&self) -> Option<Active> {
        self.current
            .read()
            .as_ref()
            .filter(|active| active.connection.state() == ConnectionState::Connected)
            .cloned()
    }

    async fn on_options_changed(&self, event: OptionsChanged) {
        *self.options.write() = event.options;

        if !event.new_connection_needed && self.connected().is_some() {
            tracing::debug!("Connection options changed in place");
            return;
        }
        self.create_connection().await;
    }

    async fn create_connection(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.swap_lock.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let old = self.current.read().clone();
        if let Some(old) = &old {
            old.connection.set_allow_reconnect(false);
        }

        let options = Arc::clone(&*self.options.read());
        let created = match self.factory.create(&options).await {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                tracing::warn!(servers = ?options.servers, "Connection factory produced no connection");
                self.discard_current().await;
                return;
            }
            Err(Error::CouldNotConnect(reason)) => {
                tracing::info!(servers = ?options.servers, reason = %reason, "Broker not reachable yet");
                if let Some(old) = &old {
                    old.connection.set_allow_reconnect(true);
                }
                return;
            }
            Err(e) => {
                tracing::error!(servers = ?options.servers, error = %e, "Failed to create connection");
                self.discard_current().await;
                return;
            }
        };

        let old_state = old.as_ref().map(|old| old.connection.state());
        if let Some(old) = &old {
            let disposition = match old_state {
                Some(ConnectionState::Reconnecting) => {
                    self.retired.insert(old.generation, Arc::clone(&old.connection));
                    old.connection.close().await
                }
                Some(ConnectionState::Connected) => {
                    self.retired.insert(old.generation, Arc::clone(&old.connection));
                    old.connection.drain().await
                }
                _ => Ok(()),
            };
            if let Err(e) = disposition {
                tracing::error!(
                    generation = old.generation,
                    error = %e,
                    "Failed to release previous connection, keeping it"
                );
                self.retired.remove(&old.generation);
                if let Err(e) = created.close().await {
                    tracing::warn!(error = %e, "Failed to close replacement connection");
                }
                old.connection.set_allow_reconnect(true);
                return;
            }
        }

        let generation = self.last_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.registry.open(generation);
        self.forward_events(generation, created.as_ref());
        *self.current.write() = Some(Active {
            generation,
            connection: created,
        });

        if let Some(old) = old {
            if !matches!(
                old_state,
                Some(ConnectionState::Reconnecting | ConnectionState::Connected)
            ) {
                if old.connection.state() != ConnectionState::Closed {
                    if let Err(e) = old.connection.close().await {
                        tracing::warn!(generation = old.generation, error = %e, "Failed to close previous connection");
                    }
                }
                self.teardown_generation(old.generation).await;
            }
        }

        tracing::info!(generation, servers = ?options.servers, "Connection established");
        if self.changed_tx.send(generation).is_err() {
            tracing::debug!(generation, "No listeners for connection changes");
        }
    }

    /// Relay `connection`'s events to the coordinator until it closes
    fn forward_events(&self, generation: u64, connection: &dyn Connection) {
        let mut events = connection.events();
        let events_tx = self.events_tx.clone();
        let cancel_token = self.cancel_token.child_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel_token.cancelled() => return,
                    received = events.recv() => match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(generation, skipped, "Missed connection events");
                            continue;
                        }
                        Err(RecvError::Closed) => return,
                    },
                };

                let closed = event == ConnectionEvent::Closed;
                if events_tx.send((generation, event)).is_err() || closed {
                    return;
                }
            }
        });
    }

    async fn on_connection_event(&self, generation: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Closed => {
                tracing::info!(generation, "Connection closed");
                self.teardown_generation(generation).await;
            }
            ConnectionEvent::Disconnected => {
                tracing::warn!(generation, "Connection lost");
            }
            ConnectionEvent::Reconnected => {
                tracing::info!(generation, "Connection re-established");
            }
            ConnectionEvent::ServerDiscovered(url) => {
                tracing::info!(generation, url = %url, "Discovered broker server");
            }
            ConnectionEvent::Error(message) => {
                tracing::error!(generation, error = %message, "Connection error");
            }
        }
    }

    /// Forget `generation`: release its subscriptions and its connection object
    async fn teardown_generation(&self, generation: u64) {
        for subscription in self.registry.close(generation) {
            release(subscription.as_ref()).await;
        }

        if self.retired.remove(&generation).is_none() {
            let mut current = self.current.write();
            if current.as_ref().is_some_and(|active| active.generation == generation) {
                *current = None;
            }
        }
    }

    /// Close and forget the current connection
    async fn discard_current(&self) {
        let Some(active) = self.current.write().take() else {
            return;
        };

        for subscription in self.registry.close(active.generation) {
            release(subscription.as_ref()).await;
        }
        if let Err(e) = active.connection.close().await {
            tracing::warn!(generation = active.generation, error = %e, "Failed to close connection");
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_token.cancel();

        let _guard = self.swap_lock.lock().await;

        for subscription in self.registry.close_all() {
            release(subscription.as_ref()).await;
        }

        let current = self.current.write().take();
        let retired: Vec<u64> = self.retired.iter().map(|entry| *entry.key()).collect();
        let connections = current
            .map(|active| (active.generation, active.connection))
            .into_iter()
            .chain(retired.into_iter().filter_map(|generation| self.retired.remove(&generation)));

        for (generation, connection) in connections {
            if connection.state() == ConnectionState::Closed {
                continue;
            }
            if let Err(e) = connection.close().await {
                tracing::warn!(generation, error = %e, "Failed to close connection");
            }
        }

        tracing::info!("Connection manager disposed");
    }
}

/// Unsubscribe, logging instead of propagating failures
async fn release(subscription: &dyn Subscription) {
    if let Err(e) = subscription.unsubscribe().await {
        tracing::warn!(subject = %subscription.subject(), error = %e, "Failed to unsubscribe");
    }
}
