//! Hive Usage Observability
//!
//! Prometheus metrics for the usage report delivery pipeline.
//!
//! # Usage
//!
//! ```no_run
//! use hive_usage_observability::{exporter, metrics};
//!
//! // Register the pipeline metrics with the global registry
//! metrics::init();
//!
//! // Expose them over HTTP
//! let metrics_router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, UsageMetrics, REGISTRY, USAGE_METRICS};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
