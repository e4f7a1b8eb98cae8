use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Pipeline metrics registered in [`REGISTRY`] by [`init`]
    pub static ref USAGE_METRICS: UsageMetrics = UsageMetrics::new();
}

/// Metric set emitted by the usage pipeline.
///
/// All handles are cheap clones of the same underlying collectors, so one
/// `UsageMetrics` can be shared by the buffer, sender and fallback queue.
/// Tests build their own instance and read values back without touching the
/// global registry.
///
/// `raw_operation_failures` is a gauge rather than a counter: operations that
/// failed to send are credited back once the fallback queue resends them.
#[derive(Clone)]
pub struct UsageMetrics {
    /// Payloads handed to the broker (first attempts and fallback resends)
    pub buffer_flushes: IntCounter,
    /// Operations written to the broker
    pub raw_operation_writes: IntCounter,
    /// Operations whose delivery is currently failed
    pub raw_operation_failures: IntGauge,
    /// Time spent serializing and compressing a batch
    pub compress_duration: Histogram,
    /// Broker round-trip time, retries included
    pub kafka_duration: Histogram,
    /// |estimated - actual| / actual for compressed payload sizes
    pub estimation_error: Histogram,
    /// Entries waiting in the fallback queue
    pub fallback_queue_size: IntGauge,
    /// Operations evicted from a full fallback queue
    pub fallback_dropped_operations: IntCounter,
}

impl UsageMetrics {
    /// Build an unregistered metric set.
    pub fn new() -> Self {
        Self {
            buffer_flushes: IntCounter::new(
                "usage_buffer_flushes_total",
                "Total payloads sent to the broker",
            )
            .expect("metric can be created"),
            raw_operation_writes: IntCounter::new(
                "usage_raw_operation_writes_total",
                "Total operations written to the broker",
            )
            .expect("metric can be created"),
            raw_operation_failures: IntGauge::new(
                "usage_raw_operation_failures",
                "Operations that failed to be written and were not resent yet",
            )
            .expect("metric can be created"),
            compress_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "usage_compress_duration_seconds",
                    "Time spent compressing a batch",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            )
            .expect("metric can be created"),
            kafka_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "usage_kafka_duration_seconds",
                    "Broker send latency in seconds",
                )
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            )
            .expect("metric can be created"),
            estimation_error: Histogram::with_opts(
                HistogramOpts::new(
                    "usage_estimation_error",
                    "Relative error of the compressed size estimate",
                )
                .buckets(vec![0.01, 0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0]),
            )
            .expect("metric can be created"),
            fallback_queue_size: IntGauge::new(
                "usage_fallback_queue_size",
                "Entries waiting in the fallback queue",
            )
            .expect("metric can be created"),
            fallback_dropped_operations: IntCounter::new(
                "usage_fallback_dropped_operations_total",
                "Operations evicted from a full fallback queue",
            )
            .expect("metric can be created"),
        }
    }

    /// Register every collector in `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.buffer_flushes.clone()))?;
        registry.register(Box::new(self.raw_operation_writes.clone()))?;
        registry.register(Box::new(self.raw_operation_failures.clone()))?;
        registry.register(Box::new(self.compress_duration.clone()))?;
        registry.register(Box::new(self.kafka_duration.clone()))?;
        registry.register(Box::new(self.estimation_error.clone()))?;
        registry.register(Box::new(self.fallback_queue_size.clone()))?;
        registry.register(Box::new(self.fallback_dropped_operations.clone()))?;
        Ok(())
    }
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        USAGE_METRICS
            .register(&REGISTRY)
            .expect("usage metrics can be registered");
    });
}
