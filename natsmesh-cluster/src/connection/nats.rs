//! `async-nats` backed connections

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_nats::connection::State;
use async_nats::{Client, ConnectErrorKind, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use natsmesh_core::config::ConnectionConfig;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{Connection, ConnectionEvent, ConnectionFactory, ConnectionState, Message, MessageHandler, Subscription};
use crate::error::{Error, Result};
use crate::options::ConnectionOptions;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Creates one NATS client per options snapshot
#[derive(Debug, Clone)]
pub struct NatsConnectionFactory {
    connect_timeout: Duration,
}

impl NatsConnectionFactory {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(Duration::from_secs(config.connect_timeout_seconds))
    }
}

#[async_trait]
impl ConnectionFactory for NatsConnectionFactory {
    async fn create(&self, options: &ConnectionOptions) -> Result<Option<Arc<dyn Connection>>> {
        if options.servers.is_empty() {
            tracing::warn!("No broker servers registered, nothing to connect to");
            return Ok(None);
        }

        let connection = NatsConnection::connect(options, self.connect_timeout).await?;
        Ok(Some(Arc::new(connection)))
    }
}

/// State shared between the connection and the client's event callback
struct Shared {
    client: Mutex<Option<Client>>,
    allow_reconnect: AtomicBool,
    draining: AtomicBool,
    closed: AtomicBool,
    lost: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    /// Parent of every subscription forwarding task
    cancel_token: CancellationToken,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        // No receivers just means nobody is tracking this connection anymore.
        let _ = self.events.send(event);
    }

    fn on_client_event(&self, event: &Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        match event {
            Event::Connected => {
                if self.lost.swap(false, Ordering::SeqCst) {
                    self.emit(ConnectionEvent::Reconnected);
                }
            }
            Event::Disconnected => {
                self.lost.store(true, Ordering::SeqCst);
                self.emit(ConnectionEvent::Disconnected);
                if !self.allow_reconnect.load(Ordering::SeqCst) {
                    self.mark_closed();
                }
            }
            other => self.emit(ConnectionEvent::Error(other.to_string())),
        }
    }

    /// Stop forwarding, drop the client and announce `Closed`, once
    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_token.cancel();
        self.client.lock().take();
        self.emit(ConnectionEvent::Closed);
    }

    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("connection closed".to_string()))
    }
}

pub struct NatsConnection {
    shared: Arc<Shared>,
}

impl NatsConnection {
    async fn connect(options: &ConnectionOptions, connect_timeout: Duration) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            client: Mutex::new(None),
            allow_reconnect: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            events,
            cancel_token: CancellationToken::new(),
        });

        let connect_options = if options.user.is_empty() {
            ConnectOptions::new()
        } else {
            ConnectOptions::with_user_and_password(options.user.clone(), options.password.clone())
        };

        // The client owns the callback, so the callback must not own the client.
        let callback_shared: Weak<Shared> = Arc::downgrade(&shared);
        let servers = options.servers.join(",");
        let pending = connect_options
            .connection_timeout(connect_timeout)
            .event_callback(move |event| {
                let shared = callback_shared.upgrade();
                async move {
                    if let Some(shared) = shared {
                        shared.on_client_event(&event);
                    }
                }
            })
            .connect(servers.as_str());

        let client = timeout(connect_timeout, pending)
            .await
            .map_err(|_| Error::CouldNotConnect(format!("no answer from {servers} within {connect_timeout:?}")))?
            .map_err(|e| classify_connect_error(&e))?;

        tracing::info!(servers = %servers, "Connected to NATS");
        *shared.client.lock() = Some(client);
        Ok(Self { shared })
    }
}

/// Unreachable brokers are transient; bad credentials or config are not
fn classify_connect_error(error: &async_nats::ConnectError) -> Error {
    match error.kind() {
        ConnectErrorKind::Io | ConnectErrorKind::TimedOut | ConnectErrorKind::Dns => {
            Error::CouldNotConnect(error.to_string())
        }
        _ => Error::Connection(error.to_string()),
    }
}

#[async_trait]
impl Connection for NatsConnection {
    fn state(&self) -> ConnectionState {
        if self.shared.closed.load(Ordering::SeqCst) {
            return ConnectionState::Closed;
        }
        if self.shared.draining.load(Ordering::SeqCst) {
            return ConnectionState::Draining;
        }

        let Some(state) = self.shared.client.lock().as_ref().map(Client::connection_state) else {
            return ConnectionState::Connecting;
        };
        // The client retries on its own until the connection is closed.
        match state {
            State::Connected => ConnectionState::Connected,
            State::Pending => ConnectionState::Connecting,
            _ => ConnectionState::Reconnecting,
        }
    }

    fn set_allow_reconnect(&self, allow: bool) {
        self.shared.allow_reconnect.store(allow, Ordering::SeqCst);
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.shared
            .client()?
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<Option<Box<dyn Subscription>>> {
        let mut subscriber = self
            .shared
            .client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| Error::Subscription(e.to_string()))?;

        let cancel_token = self.shared.cancel_token.child_token();
        let task_token = cancel_token.clone();
        let task_subject = subject.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_token.cancelled() => {
                        if let Err(e) = subscriber.unsubscribe().await {
                            tracing::debug!(subject = %task_subject, error = %e, "Unsubscribe after cancel failed");
                        }
                        return;
                    }
                    message = subscriber.next() => {
                        let Some(message) = message else { return };
                        handler(Message {
                            subject: message.subject.to_string(),
                            payload: message.payload,
                        });
                    }
                }
            }
        });

        Ok(Some(Box::new(NatsSubscription {
            subject: subject.to_string(),
            cancel_token,
        })))
    }

    async fn drain(&self) -> Result<()> {
        let client = self.shared.client()?;
        self.shared.draining.store(true, Ordering::SeqCst);

        if let Err(e) = client.drain().await {
            self.shared.draining.store(false, Ordering::SeqCst);
            return Err(Error::Connection(format!("drain failed: {e}")));
        }

        self.shared.mark_closed();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.mark_closed();
        Ok(())
    }
}

struct NatsSubscription {
    subject: String,
    cancel_token: CancellationToken,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.cancel_token.cancel();
        Ok(())
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use crate::connection::{ConnectionManager, ConnectionSettings, MockConnectionFactory};
    use std::collections::VecDeque;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accept one client, answer its handshake and pings, and hang up on request
    ///
    /// The listener is gone after the first accept, so reconnect attempts fail.
    async fn single_client_server() -> (String, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hangup_tx, mut hangup_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else { return };
            drop(listener);

            let (read, mut write) = socket.into_split();
            let info = format!(
                "INFO {{\"server_id\":\"natsmesh-test\",\"server_name\":\"natsmesh-test\",\"version\":\"2.10.0\",\"go\":\"go1.22\",\"host\":\"127.0.0.1\",\"port\":{port},\"headers\":true,\"max_payload\":1048576,\"proto\":1}}\r\n"
            );
            if write.write_all(info.as_bytes()).await.is_err() {
                return;
            }

            let mut lines = BufReader::new(read).lines();
            loop {
                tokio::select! {
                    _ = &mut hangup_rx => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.starts_with("PING") => {
                            if write.write_all(b"PONG\r\n").await.is_err() {
                                return;
                            }
                        }
                        Ok(Some(_)) => {}
                        _ => return,
                    },
                }
            }
        });

        (format!("nats://127.0.0.1:{port}"), hangup_tx)
    }

    #[tokio::test]
    async fn test_reconnecting_connection_is_closed_on_swap() {
        let (url, hangup) = single_client_server().await;
        let options = ConnectionOptions {
            servers: vec![url],
            ..ConnectionOptions::default()
        };
        let nats = Arc::new(NatsConnection::connect(&options, Duration::from_secs(5)).await.unwrap());
        assert_eq!(nats.state(), ConnectionState::Connected);

        let mut queue: VecDeque<Arc<dyn Connection>> = VecDeque::from(vec![
            Arc::clone(&nats) as Arc<dyn Connection>,
            FakeConnection::connected() as Arc<dyn Connection>,
        ]);
        let mut factory = MockConnectionFactory::new();
        factory.expect_create().returning(move |_| Ok(queue.pop_front()));
        let (_options_tx, options_rx) = broadcast::channel(4);
        let manager = ConnectionManager::new(
            Arc::new(factory),
            ConnectionSettings::default(),
            Arc::new(options),
            options_rx,
        );
        manager.create_connection().await;
        assert_eq!(manager.current_generation(), Some(1));

        let mut events = nats.events();
        hangup.send(()).unwrap();
        let lost = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(lost, ConnectionEvent::Disconnected);
        timeout(Duration::from_secs(5), async {
            while nats.state() != ConnectionState::Reconnecting {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client never started reconnecting");

        manager.create_connection().await;

        assert_eq!(manager.current_generation(), Some(2));
        assert_eq!(nats.state(), ConnectionState::Closed);
        assert!(nats.shared.client.lock().is_none());
        assert!(nats.shared.cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_no_servers_yields_no_connection() {
        let factory = NatsConnectionFactory::new(Duration::from_secs(1));
        let created = factory.create(&ConnectionOptions::default()).await.unwrap();
        assert!(created.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let factory = NatsConnectionFactory::new(Duration::from_secs(2));
        let options = ConnectionOptions {
            servers: vec!["nats://127.0.0.1:1".to_string()],
            ..ConnectionOptions::default()
        };

        match factory.create(&options).await {
            Err(e) => assert!(e.is_transient(), "unexpected error: {e}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    // Requires a local nats-server on the default port
    #[tokio::test]
    #[ignore = "Requires NATS server"]
    async fn test_nats_connection_integration() {
        let factory = NatsConnectionFactory::new(Duration::from_secs(5));
        let options = ConnectionOptions {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            port: 4222,
            ..ConnectionOptions::default()
        };
        let connection = factory.create(&options).await.unwrap().unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        let subscription = connection.subscribe("natsmesh.test", handler).await.unwrap().unwrap();
        connection.publish("natsmesh.test", Bytes::from_static(b"ping")).await.unwrap();

        let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.payload, Bytes::from_static(b"ping"));

        subscription.unsubscribe().await.unwrap();
        let mut events = connection.events();
        connection.drain().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
    }
}
