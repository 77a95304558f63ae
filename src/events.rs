//! Snowflake proxy events and the bridge to the caller's delegate
//!
//! Events are published on an [`EventDispatcher`]. An [`EventBridge`] is a
//! single listener on it that forwards each event to the matching
//! [`ProxyEvents`] method.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events buffered per listener before the slowest one starts losing them
const EVENT_CAPACITY: usize = 64;

/// ProxyStats is one periodic traffic summary of the volunteer proxy
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyStats {
    pub connection_count: u64,
    pub failed_connection_count: u64,
    pub inbound_bytes: f64,
    pub outbound_bytes: f64,
    pub inbound_unit: String,
    pub outbound_unit: String,
    pub summary_interval: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    /// A censored client connected through this proxy
    ClientConnected,
    ClientDisconnected { country: String },
    /// A client was matched but the connection could not be made
    ConnectionFailed,
    Stats(ProxyStats),
}

/// ProxyEvents is the caller's delegate for volunteer proxy events. Every
/// call runs on its own blocking task.
pub trait ProxyEvents: Send + Sync {
    fn client_connected(&self);

    fn client_disconnected(&self, _country: &str) {}

    fn connection_failed(&self) {}

    fn stats(&self, _stats: &ProxyStats) {}
}

/// EventDispatcher fans events out to every subscribed listener
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<ProxyEvent>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// publish never waits; with no listeners the event is dropped
    pub fn publish(&self, event: ProxyEvent) {
        debug!("proxy event {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// EventBridge delivers dispatcher events to one delegate until detached
pub struct EventBridge {
    task: JoinHandle<()>,
}

impl EventBridge {
    /// attach registers exactly one listener on dispatcher
    pub fn attach(dispatcher: &EventDispatcher, delegate: Arc<dyn ProxyEvents>) -> Self {
        let rx = dispatcher.subscribe();
        Self {
            task: tokio::spawn(dispatch(rx, delegate)),
        }
    }

    /// detach drops the listener; nothing is delivered afterwards
    pub fn detach(self) {
        self.task.abort();
    }
}

async fn dispatch(mut rx: broadcast::Receiver<ProxyEvent>, delegate: Arc<dyn ProxyEvents>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("event bridge fell behind, {} events dropped", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let delegate = delegate.clone();
        tokio::task::spawn_blocking(move || match event {
            ProxyEvent::ClientConnected => delegate.client_connected(),
            ProxyEvent::ClientDisconnected { country } => delegate.client_disconnected(&country),
            ProxyEvent::ConnectionFailed => delegate.connection_failed(),
            ProxyEvent::Stats(stats) => delegate.stats(&stats),
        });
    }
}
