//! Broker Sender
//!
//! Turns a [`FlushBatch`] into one broker message:
//!
//! 1. JSON-encode the reports
//! 2. Compress once (off the async runtime), timing it
//! 3. Record how far off the size estimate was, then validate the real size
//! 4. Publish through the retrying [`PayloadPublisher`]
//!
//! When publishing fails after retries the payload goes to the
//! [`FallbackQueue`] *before* the error is returned, so nothing that reached
//! the broker stage is lost. Payloads that can never be delivered (too large,
//! unserializable) are counted, reported and dropped.
//!
//! The sender also owns the broker connection and translates its lifecycle
//! events into [`HealthEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;
use hive_usage_observability::UsageMetrics;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, BrokerProducer, ConnectionEvent, PayloadPublisher};
use crate::buffer::{BatchSender, FlushBatch};
use crate::compression::Compressor;
use crate::error::{Result, UsageError};
use crate::fallback::FallbackQueue;
use crate::health::{HealthEvent, HealthState};
use crate::reporter::{FailureContext, FailureReporter};
use crate::retry::{retry_with_backoff, RetryPolicy};

pub struct BrokerSender {
    producer: Arc<dyn BrokerProducer>,
    publisher: Arc<dyn PayloadPublisher>,
    compressor: Arc<dyn Compressor>,
    fallback: FallbackQueue,
    health: HealthState,
    metrics: UsageMetrics,
    reporter: Arc<dyn FailureReporter>,
    connect_retry: RetryPolicy,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        producer: Arc<dyn BrokerProducer>,
        publisher: Arc<dyn PayloadPublisher>,
        compressor: Arc<dyn Compressor>,
        fallback: FallbackQueue,
        health: HealthState,
        metrics: UsageMetrics,
        reporter: Arc<dyn FailureReporter>,
        connect_retry: RetryPolicy,
    ) -> Self {
        Self {
            producer,
            publisher,
            compressor,
            fallback,
            health,
            metrics,
            reporter,
            connect_retry,
            listener: Mutex::new(None),
        }
    }

    /// Connect to the broker and start forwarding connection events to the
    /// health state.
    pub async fn connect(&self) -> Result<()> {
        let mut events = self.producer.events();
        let health = self.health.clone();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected) => {
                        info!("Broker producer: connected");
                        health.apply(HealthEvent::Connected);
                    }
                    Ok(ConnectionEvent::Disconnected) => {
                        info!("Broker producer: disconnected");
                        health.apply(HealthEvent::Disconnected);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed broker connection events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(listener)
        {
            previous.abort();
        }

        retry_with_backoff(&self.connect_retry, || self.producer.connect()).await?;
        Ok(())
    }

    /// Close the broker connection and stop listening for its events.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.producer.disconnect().await;
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
        result.map_err(UsageError::from)
    }

    async fn compress(&self, data: Vec<u8>) -> Result<Bytes> {
        let compressor = self.compressor.clone();
        let timer = self.metrics.compress_duration.start_timer();
        let result = tokio::task::spawn_blocking(move || compressor.compress(&data))
            .await
            .map_err(|e| UsageError::Internal(format!("compression task failed: {}", e)))?;
        timer.observe_duration();
        result
    }

    /// Count, report and return an error for a payload that is not queued.
    fn drop_batch(&self, error: UsageError, batch: &FlushBatch, operations: usize) -> UsageError {
        self.metrics.raw_operation_failures.add(operations as i64);
        self.reporter.report(
            &error,
            &FailureContext {
                batch_id: batch.batch_id.clone(),
                chunk: batch.chunk,
                operations,
                queued: false,
            },
        );
        error
    }
}

#[async_trait]
impl BatchSender for BrokerSender {
    async fn send(&self, batch: FlushBatch) -> Result<()> {
        let operations = batch.operation_count();

        let json = match serde_json::to_vec(&batch.reports) {
            Ok(json) => json,
            Err(e) => return Err(self.drop_batch(e.into(), &batch, operations)),
        };

        let payload = match self.compress(json).await {
            Ok(payload) => payload,
            Err(e) => return Err(self.drop_batch(e, &batch, operations)),
        };

        let actual = payload.len();
        if actual > 0 {
            let error = (batch.estimated_bytes as f64 - actual as f64).abs() / actual as f64;
            self.metrics.estimation_error.observe(error);
        }

        if let Err(e) = batch.validate_size(actual) {
            return Err(self.drop_batch(e, &batch, operations));
        }

        match self.publisher.publish(payload.clone()).await {
            Ok(()) => {
                self.metrics.raw_operation_writes.inc_by(operations as u64);
                info!(
                    batch_id = %batch.batch_id,
                    chunk = batch.chunk,
                    chunks = batch.chunks,
                    operations,
                    size_bytes = actual,
                    "Flushed"
                );
                Ok(())
            }
            Err(BrokerError::MessageTooLarge { limit, .. }) => {
                let error = UsageError::PayloadTooLarge {
                    size: actual,
                    limit,
                };
                Err(self.drop_batch(error, &batch, operations))
            }
            Err(e) => {
                self.metrics.raw_operation_failures.add(operations as i64);
                self.health.apply(HealthEvent::SendFailed);
                warn!(
                    batch_id = %batch.batch_id,
                    chunk = batch.chunk,
                    operations,
                    error = %e,
                    "Failed to flush. Adding to fallback queue"
                );
                self.fallback.add(payload, operations);

                let error = UsageError::Broker(e);
                self.reporter.report(
                    &error,
                    &FailureContext {
                        batch_id: batch.batch_id.clone(),
                        chunk: batch.chunk,
                        operations,
                        queued: true,
                    },
                );
                debug!(queue_size = self.fallback.size(), "Fallback queue depth");
                Err(error)
            }
        }
    }
}

impl Drop for BrokerSender {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, TopicPublisher};
    use crate::buffer::ReportBuffer;
    use crate::compression::Compression;
    use crate::config::{BufferConfig, FallbackConfig};
    use crate::health::HealthStatus;
    use crate::report::{OperationEvent, OperationRecord, RawReport};
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingReporter {
        failures: Mutex<Vec<(String, FailureContext)>>,
    }

    impl FailureReporter for CollectingReporter {
        fn report(&self, error: &UsageError, context: &FailureContext) {
            self.failures
                .lock()
                .unwrap()
                .push((error.kind().to_string(), context.clone()));
        }
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        health: HealthState,
        metrics: UsageMetrics,
        fallback: FallbackQueue,
        reporter: Arc<CollectingReporter>,
        sender: Arc<BrokerSender>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let metrics = UsageMetrics::new();
        let health = HealthState::new();
        let retry = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1), 1.0);
        let publisher = Arc::new(TopicPublisher::new(
            broker.clone(),
            "usage",
            retry.clone(),
            metrics.clone(),
        ));
        let fallback = FallbackQueue::new(
            FallbackConfig::default(),
            publisher.clone(),
            health.clone(),
            metrics.clone(),
        );
        let reporter = Arc::new(CollectingReporter::default());
        let sender = Arc::new(BrokerSender::new(
            broker.clone(),
            publisher,
            Arc::new(Compression::Gzip),
            fallback.clone(),
            health.clone(),
            metrics.clone(),
            reporter.clone(),
            retry,
        ));
        Fixture {
            broker,
            health,
            metrics,
            fallback,
            reporter,
            sender,
        }
    }

    fn buffer_for(sender: Arc<BrokerSender>) -> ReportBuffer {
        ReportBuffer::new(
            BufferConfig {
                dynamic: false,
                ..BufferConfig::default()
            },
            sender,
        )
    }

    fn report(keys: usize) -> RawReport {
        let mut report = RawReport::new("r", "target", "org");
        for k in 0..keys {
            let key = format!("k{}", k);
            report.insert_record(OperationRecord::new(&key, "{ a }", vec![]));
            report.push_operation(OperationEvent::ok(&key, 0, 1));
        }
        report
    }

    #[tokio::test]
    async fn test_connect_drives_health() {
        let f = fixture();
        let mut status = f.health.subscribe();

        f.sender.connect().await.unwrap();
        status.changed().await.unwrap();
        assert_eq!(f.health.status(), HealthStatus::Ready);

        f.broker.simulate_disconnect();
        status.changed().await.unwrap();
        assert_eq!(f.health.status(), HealthStatus::Unhealthy);

        f.broker.simulate_reconnect();
        status.changed().await.unwrap();
        assert_eq!(f.health.status(), HealthStatus::Ready);

        f.sender.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_send_counts_writes() {
        let f = fixture();
        f.sender.connect().await.unwrap();
        let buffer = buffer_for(f.sender.clone());

        buffer.add(report(4));
        buffer.flush_now().await.unwrap();

        assert_eq!(f.broker.messages().len(), 1);
        assert_eq!(f.metrics.raw_operation_writes.get(), 4);
        assert_eq!(f.metrics.raw_operation_failures.get(), 0);
        assert_eq!(f.metrics.compress_duration.get_sample_count(), 1);
        assert_eq!(f.metrics.estimation_error.get_sample_count(), 1);
        assert!(f.reporter.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_goes_to_fallback() {
        let f = fixture();
        f.sender.connect().await.unwrap();
        f.health.apply(HealthEvent::Started);
        f.broker
            .fail_next_sends(1, BrokerError::Connection("reset".into()));
        let buffer = buffer_for(f.sender.clone());

        buffer.add(report(3));
        let err = buffer.flush_now().await.unwrap_err();

        assert!(matches!(err, UsageError::Broker(BrokerError::Connection(_))));
        assert_eq!(f.fallback.size(), 1);
        assert_eq!(f.fallback.pending_operations(), 3);
        assert_eq!(f.metrics.raw_operation_failures.get(), 3);
        assert_eq!(f.health.status(), HealthStatus::Unhealthy);

        let failures = f.reporter.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broker_send_failure");
        assert!(failures[0].1.queued);
    }

    #[tokio::test]
    async fn test_message_too_large_is_not_queued() {
        let f = fixture();
        f.sender.connect().await.unwrap();
        f.broker.fail_next_sends(
            1,
            BrokerError::MessageTooLarge {
                size: 0,
                limit: 10,
            },
        );
        let buffer = buffer_for(f.sender.clone());

        buffer.add(report(2));
        let err = buffer.flush_now().await.unwrap_err();

        assert!(matches!(err, UsageError::PayloadTooLarge { limit: 10, .. }));
        assert_eq!(f.fallback.size(), 0);
        assert_eq!(f.metrics.raw_operation_failures.get(), 2);
        let failures = f.reporter.failures.lock().unwrap();
        assert_eq!(failures[0].0, "payload_too_large");
        assert!(!failures[0].1.queued);
    }

    #[tokio::test]
    async fn test_oversized_payload_fails_validation() {
        let f = fixture();
        f.sender.connect().await.unwrap();
        let buffer = ReportBuffer::new(
            BufferConfig {
                dynamic: false,
                max_payload_bytes: 20,
                safety_margin_bytes: 0,
                default_bytes_per_unit: 1,
                ..BufferConfig::default()
            },
            f.sender.clone(),
        );

        buffer.add(report(2));
        let err = buffer.flush_now().await.unwrap_err();

        assert!(matches!(err, UsageError::PayloadTooLarge { limit: 20, .. }));
        assert!(f.broker.messages().is_empty());
        assert_eq!(f.fallback.size(), 0);
    }
}
