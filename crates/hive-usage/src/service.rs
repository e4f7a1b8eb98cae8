//! Usage Service
//!
//! Facade wiring the pipeline together:
//!
//! ```text
//! collect ──► ReportBuffer ──► BrokerSender ──► TopicPublisher ──► broker
//!    ▲                              │  failure
//!    │ gated on Ready               ▼
//! HealthState ◄──────────── FallbackQueue (drains through TopicPublisher)
//!    ▲
//!    └── broker connection events
//! ```
//!
//! # Examples
//!
//! ```ignore
//! let config = UsageConfig::from_env()?;
//! let producer = Arc::new(KafkaProducer::new(config.connection.clone())?);
//! let service = UsageService::builder()
//!     .config(config)
//!     .producer(producer)
//!     .build()?;
//!
//! service.start().await?;
//! service.collect(report)?;
//! service.stop().await?;
//! ```

use hive_usage_observability::UsageMetrics;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn, Span};

use crate::broker::{BrokerProducer, TopicPublisher};
use crate::buffer::ReportBuffer;
use crate::compression::Compressor;
use crate::config::UsageConfig;
use crate::error::{Result, UsageError};
use crate::fallback::FallbackQueue;
use crate::health::{HealthEvent, HealthState, HealthStatus};
use crate::report::RawReport;
use crate::reporter::{FailureReporter, TracingReporter};
use crate::sender::BrokerSender;

struct ServiceInner {
    config: UsageConfig,
    health: HealthState,
    buffer: ReportBuffer,
    fallback: FallbackQueue,
    sender: Arc<BrokerSender>,
}

/// Handle to the usage pipeline. Cheap to clone.
#[derive(Clone)]
pub struct UsageService {
    inner: Arc<ServiceInner>,
}

impl UsageService {
    pub fn builder() -> UsageServiceBuilder {
        UsageServiceBuilder::new()
    }

    /// Accept a report for delivery.
    ///
    /// Fails with [`UsageError::NotReady`] unless the pipeline is `Ready`.
    /// Otherwise the report is buffered and the call returns immediately.
    #[instrument(skip_all, fields(ready, report_id = %report.id, report_size = report.map.len()))]
    pub fn collect(&self, report: RawReport) -> Result<()> {
        let status = self.inner.health.status();
        let ready = status == HealthStatus::Ready;
        Span::current().record("ready", ready);
        if !ready {
            debug!(%status, "Rejecting report");
            return Err(UsageError::NotReady);
        }

        debug!(operations = report.size, "Collected report");
        self.inner.buffer.add(report);
        Ok(())
    }

    /// True iff the pipeline accepts reports.
    pub fn readiness(&self) -> bool {
        self.inner.health.is_ready()
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.health.status()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.inner.health.subscribe()
    }

    /// Entries waiting in the fallback queue.
    pub fn fallback_size(&self) -> usize {
        self.inner.fallback.size()
    }

    /// Flush pending reports now instead of waiting for a trigger.
    pub async fn flush(&self) -> Result<()> {
        self.inner.buffer.flush_now().await
    }

    /// Connect to the broker and start buffering and fallback draining.
    pub async fn start(&self) -> Result<()> {
        info!(topic = %self.inner.config.topic, "Starting broker producer");
        self.inner.sender.connect().await?;
        self.inner.buffer.start();
        self.inner.health.apply(HealthEvent::Started);
        info!("Broker producer is ready");
        self.inner.fallback.start();
        Ok(())
    }

    /// Shut the pipeline down.
    ///
    /// Status becomes `Stopped` first so no new report is accepted, then the
    /// buffer is flushed, the fallback drain is paused and the broker
    /// connection is closed, in that order. The whole sequence is bounded by
    /// `shutdown_timeout`.
    pub async fn stop(&self) -> Result<()> {
        info!("Started Usage shutdown...");
        self.inner.health.apply(HealthEvent::Stop);

        let timeout = self.inner.config.shutdown_timeout;
        let inner = &self.inner;
        let shutdown = async {
            inner.buffer.stop().await;
            info!("Buffering stopped");
            inner.fallback.stop().await;
            info!("Fallback stopped");
            inner.sender.disconnect().await
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(Ok(())) => {
                info!("Usage stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Usage stopped with errors");
                Err(e)
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    fallback_size = self.inner.fallback.size(),
                    "Usage shutdown timed out"
                );
                Err(UsageError::ShutdownTimeout(timeout))
            }
        }
    }
}

/// Builder for [`UsageService`].
///
/// # Required Fields
///
/// - `producer`
///
/// # Default Values
///
/// - `config`: [`UsageConfig::default()`]
/// - `metrics`: the process-wide [`USAGE_METRICS`](hive_usage_observability::USAGE_METRICS)
/// - `reporter`: [`TracingReporter`]
/// - `compressor`: `config.compression`
pub struct UsageServiceBuilder {
    config: UsageConfig,
    producer: Option<Arc<dyn BrokerProducer>>,
    metrics: Option<UsageMetrics>,
    reporter: Arc<dyn FailureReporter>,
    compressor: Option<Arc<dyn Compressor>>,
}

impl UsageServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: UsageConfig::default(),
            producer: None,
            metrics: None,
            reporter: Arc::new(TracingReporter),
            compressor: None,
        }
    }

    pub fn config(mut self, config: UsageConfig) -> Self {
        self.config = config;
        self
    }

    /// Broker client (required).
    pub fn producer(mut self, producer: Arc<dyn BrokerProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn metrics(mut self, metrics: UsageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Validate the configuration and wire the pipeline. Nothing is started.
    pub fn build(self) -> Result<UsageService> {
        let producer = self
            .producer
            .ok_or_else(|| UsageError::ConfigError("producer is required".to_string()))?;
        self.config.validate()?;

        let config = self.config;
        let metrics = self
            .metrics
            .unwrap_or_else(|| hive_usage_observability::USAGE_METRICS.clone());
        let compressor: Arc<dyn Compressor> = match self.compressor {
            Some(compressor) => compressor,
            None => Arc::new(config.compression),
        };
        let compression = compressor.name();

        let health = HealthState::new();
        let publisher = Arc::new(TopicPublisher::new(
            producer.clone(),
            config.topic.clone(),
            config.retry.clone(),
            metrics.clone(),
        ));
        let fallback = FallbackQueue::new(
            config.fallback.clone(),
            publisher.clone(),
            health.clone(),
            metrics.clone(),
        );
        let sender = Arc::new(BrokerSender::new(
            producer,
            publisher,
            compressor,
            fallback.clone(),
            health.clone(),
            metrics.clone(),
            self.reporter,
            config.retry.clone(),
        ));
        let buffer = ReportBuffer::new(config.buffer.clone(), sender.clone());

        info!(
            topic = %config.topic,
            buffer_size = config.buffer.size,
            buffer_interval_ms = config.buffer.interval.as_millis() as u64,
            dynamic = config.buffer.dynamic,
            limit_bytes = config.buffer.limit_in_bytes(),
            compression,
            "Usage service initialized"
        );

        Ok(UsageService {
            inner: Arc::new(ServiceInner {
                config,
                health,
                buffer,
                fallback,
                sender,
            }),
        })
    }
}

impl Default for UsageServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, ConnectionEvent, InMemoryBroker};
    use crate::report::{OperationEvent, OperationRecord};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Connects normally, but a send never completes.
    struct StalledBroker {
        inner: InMemoryBroker,
    }

    #[async_trait]
    impl BrokerProducer for StalledBroker {
        async fn connect(&self) -> std::result::Result<(), BrokerError> {
            self.inner.connect().await
        }

        async fn send(&self, _topic: &str, _payload: Bytes) -> std::result::Result<(), BrokerError> {
            std::future::pending().await
        }

        async fn disconnect(&self) -> std::result::Result<(), BrokerError> {
            self.inner.disconnect().await
        }

        fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
            self.inner.events()
        }
    }

    fn service(broker: Arc<InMemoryBroker>) -> UsageService {
        UsageService::builder()
            .producer(broker)
            .metrics(UsageMetrics::new())
            .build()
            .unwrap()
    }

    fn report() -> RawReport {
        let mut report = RawReport::new("r", "target", "org");
        report.insert_record(OperationRecord::new("k", "{ a }", vec![]));
        report.push_operation(OperationEvent::ok("k", 0, 1));
        report
    }

    #[test]
    fn test_build_requires_producer() {
        let err = UsageService::builder().build().err().unwrap();
        assert!(matches!(err, UsageError::ConfigError(_)));
    }

    #[test]
    fn test_build_validates_config() {
        let mut config = UsageConfig::default();
        config.buffer.size = 0;
        let err = UsageService::builder()
            .config(config)
            .producer(Arc::new(InMemoryBroker::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, UsageError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_collect_before_start_is_not_ready() {
        let service = service(Arc::new(InMemoryBroker::new()));
        assert_eq!(service.status(), HealthStatus::Waiting);
        assert!(!service.readiness());
        assert!(matches!(service.collect(report()), Err(UsageError::NotReady)));
    }

    #[tokio::test]
    async fn test_start_collect_stop() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(broker.clone());

        service.start().await.unwrap();
        assert!(service.readiness());
        service.collect(report()).unwrap();

        service.stop().await.unwrap();
        assert_eq!(service.status(), HealthStatus::Stopped);
        assert_eq!(broker.messages().len(), 1);
        assert!(!broker.is_connected());
        assert!(matches!(service.collect(report()), Err(UsageError::NotReady)));
    }

    #[tokio::test]
    async fn test_stop_gives_up_after_shutdown_timeout() {
        let mut config = UsageConfig::default();
        config.shutdown_timeout = Duration::from_millis(100);
        let service = UsageService::builder()
            .config(config)
            .producer(Arc::new(StalledBroker {
                inner: InMemoryBroker::new(),
            }))
            .metrics(UsageMetrics::new())
            .build()
            .unwrap();

        service.start().await.unwrap();
        service.collect(report()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), service.stop())
            .await
            .expect("stop() must be bounded by shutdown_timeout");

        assert!(matches!(
            result,
            Err(UsageError::ShutdownTimeout(t)) if t == Duration::from_millis(100)
        ));
        assert_eq!(service.status(), HealthStatus::Stopped);
        assert!(!service.readiness());
    }

    #[derive(Clone, Default)]
    struct SpanFields(Arc<std::sync::Mutex<Vec<(String, String)>>>);

    impl tracing::field::Visit for SpanFields {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0
                .lock()
                .unwrap()
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for SpanFields {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            attrs.record(&mut self.clone());
        }

        fn on_record(
            &self,
            _id: &tracing::span::Id,
            values: &tracing::span::Record<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            values.record(&mut self.clone());
        }
    }

    #[test]
    fn test_collect_span_carries_readiness_and_report() {
        use tracing_subscriber::layer::SubscriberExt;

        let fields = SpanFields::default();
        let subscriber = tracing_subscriber::registry().with(fields.clone());
        let service = service(Arc::new(InMemoryBroker::new()));

        let result = tracing::subscriber::with_default(subscriber, || service.collect(report()));
        assert!(matches!(result, Err(UsageError::NotReady)));

        let recorded = fields.0.lock().unwrap().clone();
        for expected in [("ready", "false"), ("report_id", "r"), ("report_size", "1")] {
            assert!(
                recorded
                    .iter()
                    .any(|(name, value)| name == expected.0 && value == expected.1),
                "missing {:?} in {:?}",
                expected,
                recorded
            );
        }
    }
}
