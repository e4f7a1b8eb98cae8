//! Failure reporting hook.
//!
//! Delivery failures are handled inside the pipeline, but operators still
//! want to hear about them. A [`FailureReporter`] is handed to the service at
//! construction and receives every failed send together with its context.

use tracing::error;

use crate::error::UsageError;

/// What was being sent when the failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub batch_id: String,
    pub chunk: usize,
    pub operations: usize,
    /// Whether the payload was kept in the fallback queue
    pub queued: bool,
}

pub trait FailureReporter: Send + Sync {
    fn report(&self, error: &UsageError, context: &FailureContext);
}

/// Default reporter: an `error!` event per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, error: &UsageError, context: &FailureContext) {
        error!(
            batch_id = %context.batch_id,
            chunk = context.chunk,
            operations = context.operations,
            queued = context.queued,
            kind = error.kind(),
            error = %error,
            "Failed to flush usage reports"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_reporter_does_not_panic() {
        let reporter: Box<dyn FailureReporter> = Box::new(TracingReporter);
        reporter.report(
            &UsageError::NotReady,
            &FailureContext {
                batch_id: "b".into(),
                chunk: 0,
                operations: 3,
                queued: false,
            },
        );
    }
}
