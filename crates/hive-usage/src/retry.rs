//! Bounded, jittered exponential backoff for broker calls.
//!
//! Both the initial broker connect and every payload publish go through
//! [`retry_with_backoff`]. Only errors for which
//! [`BrokerError::is_retryable`] holds are retried; a rejected or oversized
//! payload comes back on the first attempt.
//!
//! With the defaults a publish that keeps failing is tried six times:
//!
//! ```text
//! try ─ ~300ms ─ try ─ ~600ms ─ try ─ ~1.2s ─ try ─ ~2.4s ─ try ─ ~4.8s ─ try ─► Err
//! ```
//!
//! Each wait is drawn uniformly from `base * [1 - jitter, 1 + jitter]`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::BrokerError;

/// How often and how patiently a broker call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means a single attempt
    pub max_retries: usize,
    pub initial_backoff: Duration,
    /// Upper bound for a single wait, before jitter
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Randomization factor in `[0, 1]`; `0` gives exact waits
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with exact (unjittered) waits.
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Wait before retry number `retry + 1`, without jitter.
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !millis.is_finite() || millis >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(millis as u64)
    }

    /// [`backoff`](Self::backoff) scaled by a random factor around 1.
    pub fn jittered_backoff(&self, retry: usize) -> Duration {
        let base = self.backoff(retry);
        if self.jitter_factor == 0.0 {
            return base;
        }
        let low = 1.0 - self.jitter_factor;
        let high = 1.0 + self.jitter_factor;
        base.mul_f64(rand::thread_rng().gen_range(low..=high))
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// retries are used up. The last error is returned in the latter two cases.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let attempts = policy.max_retries.saturating_add(1);
    let mut retry = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(attempts = retry + 1, "Broker call recovered");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if retry + 1 >= attempts {
            warn!(attempts, error = %err, "Broker call failed after all retries");
            return Err(err);
        }

        let wait = policy.jittered_backoff(retry);
        debug!(
            attempt = retry + 1,
            of = attempts,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "Broker call failed, retrying"
        );
        tokio::time::sleep(wait).await;
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4), 2.0)
    }

    /// Fails with `err` for the first `failures` calls, then returns the call count.
    async fn run(
        policy: RetryPolicy,
        failures: usize,
        err: BrokerError,
    ) -> (Result<usize, BrokerError>, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(&policy, || {
            let counter = counter.clone();
            let err = err.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(err)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_defaults_match_broker_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(300));
        assert_eq!(policy.jitter_factor, 0.2);

        let waits: Vec<u128> = (0..5).map(|r| policy.backoff(r).as_millis()).collect();
        assert_eq!(waits, vec![300, 600, 1200, 2400, 4800]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(10), 2.0);
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(usize::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_band() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let wait = policy.jittered_backoff(1).as_millis();
            assert!((479..=721).contains(&wait), "wait {wait}ms outside 600ms ±20%");
        }
        assert_eq!(policy.clone().with_jitter(0.0).jittered_backoff(3), policy.backoff(3));
        assert_eq!(policy.clone().with_jitter(7.0).jitter_factor, 1.0);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_errors() {
        let (result, calls) = run(quick(5), 2, BrokerError::Disconnected).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (result, calls) = run(
            quick(2),
            usize::MAX,
            BrokerError::Connection("connection refused".into()),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let rejected = BrokerError::Rejected {
            code: 87,
            message: "invalid record".into(),
        };
        let (result, calls) = run(quick(5), 1, rejected.clone()).await;
        assert_eq!(result, Err(rejected));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_zero_retries_is_one_attempt() {
        let (result, calls) = run(quick(0), 1, BrokerError::Timeout(Duration::from_secs(1))).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
