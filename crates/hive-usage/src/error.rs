//! Error types for the usage pipeline.
//!
//! Callers of [`UsageService::collect`](crate::UsageService::collect) only ever
//! observe [`UsageError::NotReady`]. Everything downstream of the buffer is
//! handled inside the pipeline and surfaces through logs, metrics and the
//! [`FailureReporter`](crate::reporter::FailureReporter).
//!
//! ## Error Handling Strategy
//!
//! - **Backpressure**: `NotReady`
//! - **Recovered internally**: `Broker` (payload is queued for resend before the error is returned)
//! - **Dropped, needs operator attention**: `PayloadTooLarge`, `Serialization`, `Compression`
//! - **Startup**: `ConfigError`
//! - **Shutdown**: `ShutdownTimeout`

use std::time::Duration;
use thiserror::Error;

use crate::broker::BrokerError;

/// Convenience type alias for `Result<T, UsageError>`.
pub type Result<T> = std::result::Result<T, UsageError>;

/// Error type for usage pipeline operations.
#[derive(Debug, Error)]
pub enum UsageError {
    /// The pipeline is not accepting reports.
    ///
    /// Returned by `collect` whenever the health status is anything but
    /// `Ready`. HTTP handlers translate this into `503 Service Unavailable`.
    #[error("Usage is not ready yet")]
    NotReady,

    /// Delivery to the broker failed after the retry policy was exhausted.
    ///
    /// By the time this error is returned the compressed payload already sits
    /// in the fallback queue.
    #[error("Broker send failed: {0}")]
    Broker(#[from] BrokerError),

    /// Compressed payload exceeds the broker's hard size ceiling.
    ///
    /// Not retried and not queued. Lower the buffer size or the payload
    /// safety margin if this shows up.
    #[error("Payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge {
        /// Actual compressed size
        size: usize,
        /// Hard ceiling
        limit: usize,
    },

    /// A batch could not be serialized to JSON.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The compressor failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// `stop()` did not finish in time; some in-flight work may be abandoned.
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for UsageError {
    fn from(err: serde_json::Error) -> Self {
        UsageError::Serialization(err.to_string())
    }
}

impl UsageError {
    /// Short machine-friendly label, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            UsageError::NotReady => "not_ready",
            UsageError::Broker(_) => "broker_send_failure",
            UsageError::PayloadTooLarge { .. } => "payload_too_large",
            UsageError::Serialization(_) => "serialization",
            UsageError::Compression(_) => "compression",
            UsageError::ConfigError(_) => "config",
            UsageError::ShutdownTimeout(_) => "shutdown_timeout",
            UsageError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_message() {
        assert_eq!(UsageError::NotReady.to_string(), "Usage is not ready yet");
    }

    #[test]
    fn test_payload_too_large_message() {
        let err = UsageError::PayloadTooLarge {
            size: 1_200_000,
            limit: 1_000_000,
        };
        assert_eq!(
            err.to_string(),
            "Payload of 1200000 bytes exceeds the limit of 1000000 bytes"
        );
        assert_eq!(err.kind(), "payload_too_large");
    }

    #[test]
    fn test_from_broker_error() {
        let err: UsageError = BrokerError::Connection("refused".to_string()).into();
        assert!(matches!(err, UsageError::Broker(_)));
        assert_eq!(err.kind(), "broker_send_failure");
    }

    #[test]
    fn test_from_serde_error() {
        let parse = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: UsageError = parse.into();
        assert!(matches!(err, UsageError::Serialization(_)));
    }
}
