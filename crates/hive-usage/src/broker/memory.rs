//! In-memory broker used by tests and local runs.
//!
//! Records every delivered message and lets a test script failures or flip
//! the connection state, emitting the same lifecycle events a real client
//! would.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{BrokerError, BrokerProducer, ConnectionEvent, EVENT_CHANNEL_CAPACITY};

/// A message accepted by the [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredMessage {
    pub topic: String,
    pub payload: Bytes,
}

pub struct InMemoryBroker {
    events: broadcast::Sender<ConnectionEvent>,
    connected: AtomicBool,
    attempts: AtomicUsize,
    messages: Mutex<Vec<DeliveredMessage>>,
    scripted_failures: Mutex<VecDeque<BrokerError>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            connected: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next `count` send attempts fail with `error`.
    pub fn fail_next_sends(&self, count: usize, error: BrokerError) {
        let mut failures = self.scripted_failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Messages delivered so far, in delivery order.
    pub fn messages(&self) -> Vec<DeliveredMessage> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of `send` calls, successful or not.
    pub fn send_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop the connection as if the broker went away.
    pub fn simulate_disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    /// Restore the connection.
    pub fn simulate_reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Connected);
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.simulate_reconnect();
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }

        let scripted = self
            .scripted_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(err) = scripted {
            debug!(topic, error = %err, "Scripted send failure");
            return Err(err);
        }

        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DeliveredMessage {
                topic: topic.to_string(),
                payload,
            });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.simulate_disconnect();
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
