//! Fallback Queue
//!
//! Holds compressed payloads whose delivery failed and replays them, oldest
//! first and one at a time, until the broker takes them.
//!
//! ```text
//!  BrokerSender ── send failed ──► add(payload, ops)
//!                                       │
//!                              ┌────────▼────────┐
//!                              │ VecDeque (FIFO) │ bounded by total bytes,
//!                              └────────┬────────┘ oldest idle entry evicted first
//!                                       │ front
//!                                  drain loop ──publish──► broker
//!                                       │
//!                     ok: pop, move ops from failures to writes,
//!                         queue empty → HealthEvent::FallbackDrained
//!                     err: wait retry_interval, try the same entry again
//! ```
//!
//! Entries live for the life of the process. `stop()` pauses the drain loop
//! and keeps whatever is queued.

use bytes::Bytes;
use hive_usage_observability::UsageMetrics;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::PayloadPublisher;
use crate::config::FallbackConfig;
use crate::health::{HealthEvent, HealthState};

/// A payload waiting to be resent.
#[derive(Debug, Clone)]
pub struct FallbackEntry {
    /// Already compressed message value
    pub payload: Bytes,
    pub operation_count: usize,
    pub enqueued_at: SystemTime,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<FallbackEntry>,
    bytes: usize,
    /// The front entry is being resent
    in_flight: bool,
}

struct FallbackInner {
    config: FallbackConfig,
    publisher: Arc<dyn PayloadPublisher>,
    health: HealthState,
    metrics: UsageMetrics,
    state: Mutex<QueueState>,
    notify: Notify,
    drain: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[derive(Clone)]
pub struct FallbackQueue {
    inner: Arc<FallbackInner>,
}

impl FallbackQueue {
    pub fn new(
        config: FallbackConfig,
        publisher: Arc<dyn PayloadPublisher>,
        health: HealthState,
        metrics: UsageMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(FallbackInner {
                config,
                publisher,
                health,
                metrics,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                drain: Mutex::new(None),
            }),
        }
    }

    /// Enqueue a payload. Never blocks and never rejects.
    ///
    /// When the queue exceeds `max_bytes`, the oldest entries are evicted.
    /// Neither the entry being resent nor the one just added is ever evicted,
    /// so the queue can sit above `max_bytes` until the resend finishes.
    pub fn add(&self, payload: Bytes, operation_count: usize) {
        let mut dropped_entries = 0usize;
        let mut dropped_operations = 0usize;

        let depth = {
            let mut state = lock(&self.inner.state);
            state.bytes += payload.len();
            state.entries.push_back(FallbackEntry {
                payload,
                operation_count,
                enqueued_at: SystemTime::now(),
            });

            let oldest_evictable = usize::from(state.in_flight);
            while state.bytes > self.inner.config.max_bytes
                && state.entries.len() > oldest_evictable + 1
            {
                let Some(evicted) = state.entries.remove(oldest_evictable) else {
                    break;
                };
                state.bytes -= evicted.payload.len();
                dropped_entries += 1;
                dropped_operations += evicted.operation_count;
            }

            state.entries.len()
        };

        self.inner.metrics.fallback_queue_size.set(depth as i64);
        if dropped_entries > 0 {
            self.inner
                .metrics
                .fallback_dropped_operations
                .inc_by(dropped_operations as u64);
            warn!(
                dropped_entries,
                dropped_operations,
                max_bytes = self.inner.config.max_bytes,
                "Fallback queue full, evicted oldest entries"
            );
        }
        debug!(depth, operations = operation_count, "Added payload to fallback queue");

        self.inner.notify.notify_one();
    }

    /// Number of queued entries.
    pub fn size(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }

    /// Total payload bytes held.
    pub fn bytes(&self) -> usize {
        lock(&self.inner.state).bytes
    }

    /// Operations across all queued entries.
    pub fn pending_operations(&self) -> usize {
        lock(&self.inner.state)
            .entries
            .iter()
            .map(|e| e.operation_count)
            .sum()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.drain).is_some()
    }

    /// Start the drain loop. No-op if already running.
    pub fn start(&self) {
        let mut drain = lock(&self.inner.drain);
        if drain.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.drain_loop(token).await });
        *drain = Some((cancel, handle));
        info!("Fallback queue started");
    }

    /// Stop the drain loop after the current resend, keeping queued entries.
    pub async fn stop(&self) {
        let drain = lock(&self.inner.drain).take();
        if let Some((cancel, handle)) = drain {
            cancel.cancel();
            let _ = handle.await;
        }
        info!(remaining = self.size(), "Fallback queue stopped");
    }

    async fn drain_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let front = {
                let mut state = lock(&self.inner.state);
                let front = state
                    .entries
                    .front()
                    .map(|e| (e.payload.clone(), e.operation_count));
                state.in_flight = front.is_some();
                front
            };

            let (payload, operation_count) = match front {
                Some(front) => front,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.inner.notify.notified() => {}
                    }
                    continue;
                }
            };

            match self.inner.publisher.publish(payload).await {
                Ok(()) => self.on_resent(operation_count),
                Err(e) => {
                    lock(&self.inner.state).in_flight = false;
                    warn!(
                        error = %e,
                        operations = operation_count,
                        retry_in_ms = self.inner.config.retry_interval.as_millis() as u64,
                        "Fallback resend failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.config.retry_interval) => {}
                    }
                }
            }
        }

        lock(&self.inner.state).in_flight = false;
        debug!("Fallback drain loop exited");
    }

    fn on_resent(&self, operation_count: usize) {
        let remaining = {
            let mut state = lock(&self.inner.state);
            if let Some(entry) = state.entries.pop_front() {
                state.bytes -= entry.payload.len();
            }
            state.in_flight = false;
            state.entries.len()
        };

        let metrics = &self.inner.metrics;
        metrics.raw_operation_failures.sub(operation_count as i64);
        metrics.raw_operation_writes.inc_by(operation_count as u64);
        metrics.fallback_queue_size.set(remaining as i64);
        info!(
            operations = operation_count,
            remaining, "Resent payload from fallback queue"
        );

        if remaining == 0 {
            info!("Fallback queue flushed");
            self.inner.health.apply(HealthEvent::FallbackDrained);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
