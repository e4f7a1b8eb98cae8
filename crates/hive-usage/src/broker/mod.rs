//! Broker abstraction.
//!
//! The pipeline talks to the message broker through two seams:
//!
//! - [`BrokerProducer`]: a connection-owning client that can send one message
//!   to a topic and announces connection lifecycle changes as
//!   [`ConnectionEvent`]s on a broadcast channel.
//! - [`PayloadPublisher`]: "put these bytes on the usage topic". Implemented by
//!   [`TopicPublisher`], which layers the retry policy and broker metrics over a
//!   producer. Both the sender and the fallback queue publish through it.
//!
//! ```text
//!  BrokerSender ──┐
//!                 ├──► TopicPublisher ──retry──► BrokerProducer ──► broker
//!  FallbackQueue ─┘                                   │
//!                                                     └── events() ──► HealthState
//! ```
//!
//! Implementations: [`InMemoryBroker`] (tests, local runs) and, with the
//! `kafka` feature, `KafkaProducer`.

use async_trait::async_trait;
use bytes::Bytes;
use hive_usage_observability::UsageMetrics;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::retry::{retry_with_backoff, RetryPolicy};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaProducer;
pub use memory::InMemoryBroker;

/// Capacity of the connection event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors reported by a broker client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Could not reach the broker or the connection broke mid-request.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker did not answer in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The broker answered with an error code.
    #[error("Broker rejected the request (code {code}): {message}")]
    Rejected { code: i16, message: String },

    /// The message exceeds the broker's maximum message size.
    #[error("Message of {size} bytes exceeds the broker limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// SASL handshake or credentials rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The producer is not connected.
    #[error("Producer is disconnected")]
    Disconnected,
}

impl BrokerError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Connection(_) => true,
            BrokerError::Timeout(_) => true,
            BrokerError::Disconnected => true,

            BrokerError::Rejected { .. } => false,
            BrokerError::MessageTooLarge { .. } => false,
            BrokerError::Authentication(_) => false,
        }
    }
}

/// Connection lifecycle notifications emitted by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// A broker client owning a persistent connection.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Establish the connection. Emits [`ConnectionEvent::Connected`] on success.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Send a single message, uncompressed at the broker level.
    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Close the connection. Emits [`ConnectionEvent::Disconnected`].
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Subscribe to connection lifecycle events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Publishes an already-compressed payload to the usage topic.
#[async_trait]
pub trait PayloadPublisher: Send + Sync {
    async fn publish(&self, payload: Bytes) -> Result<(), BrokerError>;
}

/// [`PayloadPublisher`] bound to one topic, with retries and broker metrics.
pub struct TopicPublisher {
    producer: Arc<dyn BrokerProducer>,
    topic: String,
    retry: RetryPolicy,
    metrics: UsageMetrics,
}

impl TopicPublisher {
    pub fn new(
        producer: Arc<dyn BrokerProducer>,
        topic: impl Into<String>,
        retry: RetryPolicy,
        metrics: UsageMetrics,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            retry,
            metrics,
        }
    }
}

#[async_trait]
impl PayloadPublisher for TopicPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), BrokerError> {
        self.metrics.buffer_flushes.inc();
        let timer = self.metrics.kafka_duration.start_timer();

        let result = retry_with_backoff(&self.retry, || {
            let payload = payload.clone();
            async move { self.producer.send(&self.topic, payload).await }
        })
        .await;

        timer.observe_duration();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_retry(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    #[test]
    fn test_is_retryable_classification() {
        assert!(BrokerError::Connection("refused".into()).is_retryable());
        assert!(BrokerError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(BrokerError::Disconnected.is_retryable());

        assert!(!BrokerError::Rejected {
            code: 87,
            message: "invalid record".into()
        }
        .is_retryable());
        assert!(!BrokerError::MessageTooLarge { size: 2, limit: 1 }.is_retryable());
        assert!(!BrokerError::Authentication("bad password".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_topic_publisher_sends_to_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.connect().await.unwrap();
        let metrics = UsageMetrics::new();
        let publisher =
            TopicPublisher::new(broker.clone(), "usage_reports_v2", fast_retry(0), metrics.clone());

        publisher.publish(Bytes::from_static(b"payload")).await.unwrap();

        let messages = broker.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "usage_reports_v2");
        assert_eq!(messages[0].payload, Bytes::from_static(b"payload"));
        assert_eq!(metrics.buffer_flushes.get(), 1);
        assert_eq!(metrics.kafka_duration.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn test_topic_publisher_retries_transient_failures() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.connect().await.unwrap();
        broker.fail_next_sends(2, BrokerError::Connection("reset".into()));
        let publisher =
            TopicPublisher::new(broker.clone(), "t", fast_retry(3), UsageMetrics::new());

        publisher.publish(Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(broker.send_attempts(), 3);
        assert_eq!(broker.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_topic_publisher_gives_up_after_retries() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.connect().await.unwrap();
        broker.fail_next_sends(5, BrokerError::Timeout(Duration::from_millis(1)));
        let publisher =
            TopicPublisher::new(broker.clone(), "t", fast_retry(1), UsageMetrics::new());

        let err = publisher.publish(Bytes::from_static(b"x")).await.unwrap_err();

        assert!(matches!(err, BrokerError::Timeout(_)));
        assert_eq!(broker.send_attempts(), 2);
        assert!(broker.messages().is_empty());
    }
}
