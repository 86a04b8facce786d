//! Scripted in-memory connection for manager tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Connection, ConnectionEvent, ConnectionState, MessageHandler, Subscription};
use crate::error::{Error, Result};

/// Result of one scripted `subscribe` call
#[derive(Debug, Clone, Copy)]
pub(crate) enum SubscribeOutcome {
    Handle,
    Absent,
    Fail,
}

pub(crate) struct FakeConnection {
    state: Mutex<ConnectionState>,
    allow_reconnect: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    subscribe_script: Mutex<VecDeque<SubscribeOutcome>>,
    pub fail_publish: AtomicBool,
    pub fail_drain: AtomicBool,
    pub fail_unsubscribe: AtomicBool,
    /// Emit `Closed` from inside `drain`/`close` and give the coordinator time to react
    pub announce_close: AtomicBool,
    pub publish_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub drain_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    /// Unsubscribe flags of every handle handed out, in order
    pub handles: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeConnection {
    pub fn connected() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Mutex::new(ConnectionState::Connected),
            allow_reconnect: AtomicBool::new(true),
            events,
            subscribe_script: Mutex::new(VecDeque::new()),
            fail_publish: AtomicBool::new(false),
            fail_drain: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            announce_close: AtomicBool::new(false),
            publish_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            drain_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn allows_reconnect(&self) -> bool {
        self.allow_reconnect.load(Ordering::SeqCst)
    }

    /// Queue outcomes for upcoming `subscribe` calls; an empty script hands out handles
    pub fn script_subscribe(&self, outcomes: impl IntoIterator<Item = SubscribeOutcome>) {
        self.subscribe_script.lock().extend(outcomes);
    }

    pub fn emit(&self, event: ConnectionEvent) {
        if event == ConnectionEvent::Closed {
            self.set_state(ConnectionState::Closed);
        }
        let _ = self.events.send(event);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn maybe_announce_close(&self) {
        if self.announce_close.load(Ordering::SeqCst) {
            self.emit(ConnectionEvent::Closed);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

struct FakeSubscription {
    subject: String,
    unsubscribed: Arc<AtomicBool>,
    fail: bool,
}

#[async_trait]
impl Subscription for FakeSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.unsubscribed.store(true, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Subscription(format!("unsubscribe from {} failed", self.subject)));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_allow_reconnect(&self, allow: bool) {
        self.allow_reconnect.store(allow, Ordering::SeqCst);
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn publish(&self, subject: &str, _payload: Bytes) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("publish to {subject} failed")));
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, _handler: MessageHandler) -> Result<Option<Box<dyn Subscription>>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .subscribe_script
            .lock()
            .pop_front()
            .unwrap_or(SubscribeOutcome::Handle);

        match outcome {
            SubscribeOutcome::Handle => {
                let unsubscribed = Arc::new(AtomicBool::new(false));
                self.handles.lock().push(Arc::clone(&unsubscribed));
                Ok(Some(Box::new(FakeSubscription {
                    subject: subject.to_string(),
                    unsubscribed,
                    fail: self.fail_unsubscribe.load(Ordering::SeqCst),
                })))
            }
            SubscribeOutcome::Absent => Ok(None),
            SubscribeOutcome::Fail => Err(Error::Subscription(format!("subscribe to {subject} failed"))),
        }
    }

    async fn drain(&self) -> Result<()> {
        self.drain_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_drain.load(Ordering::SeqCst) {
            return Err(Error::Connection("drain failed".to_string()));
        }
        self.set_state(ConnectionState::Draining);
        self.maybe_announce_close().await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        self.maybe_announce_close().await;
        Ok(())
    }
}
