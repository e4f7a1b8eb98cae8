//! Hive Usage - usage report delivery pipeline
//!
//! Accepts usage reports (GraphQL operation executions) at high volume,
//! buffers them, splits batches that would exceed the broker's payload limit,
//! compresses and publishes them to a Kafka-compatible topic. Payloads that
//! cannot be delivered are kept in a fallback queue and replayed once the
//! broker is back. A health state machine gates ingestion so callers get
//! backpressure instead of silent loss.
//!
//! # Examples
//!
//! ```ignore
//! use hive_usage::{UsageConfig, UsageService};
//!
//! let config = UsageConfig::from_env()?;
//! let service = UsageService::builder()
//!     .producer(Arc::new(KafkaProducer::new(config.connection.clone())?))
//!     .config(config)
//!     .build()?;
//!
//! service.start().await?;
//!
//! match service.collect(report) {
//!     Ok(()) => {}
//!     Err(UsageError::NotReady) => { /* respond 503 */ }
//!     Err(e) => return Err(e.into()),
//! }
//!
//! service.stop().await?;
//! ```
//!
//! # Features
//!
//! - `kafka`: enables `KafkaProducer`, backed by `rskafka`

pub mod broker;
pub mod buffer;
pub mod compression;
pub mod config;
pub mod error;
pub mod estimator;
pub mod fallback;
pub mod health;
pub mod report;
pub mod reporter;
pub mod retry;
pub mod sender;
pub mod service;
pub mod split;

#[cfg(feature = "kafka")]
pub use broker::KafkaProducer;
pub use broker::{
    BrokerError, BrokerProducer, ConnectionEvent, InMemoryBroker, PayloadPublisher,
    TopicPublisher,
};
pub use buffer::{BatchSender, FlushBatch, ReportBuffer};
pub use compression::{Compression, Compressor};
pub use config::{
    BrokerConnectionConfig, BrokerLogLevel, BufferConfig, FallbackConfig, SaslCredentials,
    SaslMechanism, TlsSettings, UsageConfig,
};
pub use error::{Result, UsageError};
pub use estimator::SizeEstimator;
pub use fallback::{FallbackEntry, FallbackQueue};
pub use health::{HealthEvent, HealthState, HealthStatus};
pub use report::{
    ClientInfo, Execution, OperationEvent, OperationKey, OperationMetadata, OperationRecord,
    RawReport,
};
pub use reporter::{FailureContext, FailureReporter, TracingReporter};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use sender::BrokerSender;
pub use service::{UsageService, UsageServiceBuilder};
pub use split::{calculate_chunk_size, split_report};
