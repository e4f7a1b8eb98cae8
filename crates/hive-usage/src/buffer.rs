//! Report Buffer
//!
//! Accumulates incoming reports and hands them to a [`BatchSender`] in
//! batches small enough for the broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  add(report) │ never blocks, never rejects
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  Pending                     │
//! │  - reports: Vec<RawReport>   │
//! │  - units (map entries)       │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Flush on size (fixed: units >= size, dynamic: estimate >= limit)
//!        ├─→ Flush on time (interval)
//!        ├─→ Flush on stop()
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  estimate > limit ?          │──yes──► split into N chunks, same batch_id
//! └──────┬───────────────────────┘
//!        │ no
//!        ▼
//!   BatchSender::send(FlushBatch)
//! ```
//!
//! ## Splitting
//!
//! `N` starts at `ceil(estimate / limit)`. Every pending report is cut into at
//! most `N` key-disjoint chunks by [`split_report`] and the chunks are packed
//! into `N` groups, each chunk going to the currently lightest group. Map
//! entries are indivisible, so a group can still be estimated over the limit;
//! `N` then grows until every group fits or each group holds a single unit.
//! Each group is sent as its own [`FlushBatch`]; all of them carry the same
//! `batch_id` and are sent concurrently.
//!
//! Operation events whose key is missing from their report's map are dropped
//! with a warning before estimating, whether or not the flush is split.
//!
//! The estimate is only a guess. The sender measures the real compressed size
//! and calls [`FlushBatch::validate_size`], which feeds the dynamic estimator
//! and fails the chunk if it still exceeds the hard ceiling.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::error::{Result, UsageError};
use crate::estimator::SizeEstimator;
use crate::report::RawReport;
use crate::split::split_report;

/// Destination of flushed batches.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send(&self, batch: FlushBatch) -> Result<()>;
}

/// One unit of delivery: a group of reports that goes out as one message.
#[derive(Debug)]
pub struct FlushBatch {
    /// Shared by every chunk produced from the same flush
    pub batch_id: String,
    /// Index of this chunk within the flush
    pub chunk: usize,
    /// Number of chunks the flush was split into
    pub chunks: usize,
    pub reports: Vec<RawReport>,
    /// Estimated compressed size
    pub estimated_bytes: usize,
    validator: SizeValidator,
}

impl FlushBatch {
    /// Total operation events across all reports.
    pub fn operation_count(&self) -> usize {
        self.reports.iter().map(|r| r.size).sum()
    }

    /// Total size units across all reports.
    pub fn units(&self) -> usize {
        self.reports.iter().map(|r| r.units()).sum()
    }

    /// Check the real compressed size against the hard ceiling.
    ///
    /// Also teaches the dynamic estimator, whether or not the size is
    /// acceptable.
    pub fn validate_size(&self, actual_bytes: usize) -> Result<()> {
        self.validator.validate(actual_bytes, self.units())
    }
}

#[derive(Debug, Clone)]
struct SizeValidator {
    estimator: Arc<Mutex<SizeEstimator>>,
    max_payload_bytes: usize,
}

impl SizeValidator {
    fn validate(&self, actual_bytes: usize, units: usize) -> Result<()> {
        lock(&self.estimator).teach(actual_bytes, units);
        if actual_bytes > self.max_payload_bytes {
            return Err(UsageError::PayloadTooLarge {
                size: actual_bytes,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct Pending {
    reports: Vec<RawReport>,
    units: usize,
    /// Set by `stop()`; checked under the same lock as the push
    closed: bool,
}

struct BufferInner {
    config: BufferConfig,
    sender: Arc<dyn BatchSender>,
    pending: Mutex<Pending>,
    estimator: Arc<Mutex<SizeEstimator>>,
    started: AtomicBool,
    tasks: TaskTracker,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the buffer.
#[derive(Clone)]
pub struct ReportBuffer {
    inner: Arc<BufferInner>,
}

impl ReportBuffer {
    pub fn new(config: BufferConfig, sender: Arc<dyn BatchSender>) -> Self {
        let estimator = SizeEstimator::new(config.default_bytes_per_unit, config.dynamic);
        Self {
            inner: Arc::new(BufferInner {
                config,
                sender,
                pending: Mutex::new(Pending::default()),
                estimator: Arc::new(Mutex::new(estimator)),
                started: AtomicBool::new(false),
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Queue a report for the next flush.
    ///
    /// After `start()`, crossing the size threshold schedules a flush in the
    /// background. After `stop()`, reports are dropped with a warning.
    pub fn add(&self, report: RawReport) {
        let should_flush = {
            let mut pending = lock(&self.inner.pending);
            if pending.closed {
                warn!(report_id = %report.id, "Buffer stopped, dropping report");
                return;
            }
            pending.units += report.units();
            pending.reports.push(report);
            self.inner.started.load(Ordering::Acquire) && self.threshold_reached(pending.units)
        };

        if should_flush {
            let this = self.clone();
            self.inner.tasks.spawn(async move {
                this.flush_logged().await;
            });
        }
    }

    /// Start the periodic flush timer and enable size-triggered flushes.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let period = self.inner.config.interval;
        let cancel = self.inner.cancel.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => this.flush_logged().await,
                }
            }
            debug!("Buffer flush timer stopped");
        });
        *lock(&self.inner.timer) = Some(handle);

        // Reports queued before start may already be over the threshold
        if self.threshold_reached(self.pending_units()) {
            let this = self.clone();
            self.inner.tasks.spawn(async move {
                this.flush_logged().await;
            });
        }
    }

    /// Stop accepting reports, flush what is pending and wait for in-flight
    /// flushes to finish.
    pub async fn stop(&self) {
        lock(&self.inner.pending).closed = true;
        self.inner.cancel.cancel();

        let timer = lock(&self.inner.timer).take();
        if let Some(handle) = timer {
            let _ = handle.await;
        }

        self.flush_logged().await;

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Buffer stopped");
    }

    /// Flush everything pending right now.
    ///
    /// Returns the first chunk error, after every chunk has been attempted.
    pub async fn flush_now(&self) -> Result<()> {
        let (mut reports, units) = {
            let mut pending = lock(&self.inner.pending);
            let units = std::mem::take(&mut pending.units);
            (std::mem::take(&mut pending.reports), units)
        };
        if reports.is_empty() {
            return Ok(());
        }

        for report in &mut reports {
            let dangling = report.drop_dangling_operations();
            if dangling > 0 {
                warn!(
                    report_id = %report.id,
                    dangling,
                    "Dropped operations referencing keys missing from the operation map"
                );
            }
        }

        let batch_id = Uuid::new_v4().to_string();
        let limit = self.inner.config.limit_in_bytes();
        let estimator = lock(&self.inner.estimator).clone();
        let estimated = estimator.estimate(units);

        let groups = if estimated > limit && limit > 0 {
            let groups = plan_chunks(reports, units, &estimator, limit);
            info!(
                batch_id = %batch_id,
                estimated_bytes = estimated,
                limit_bytes = limit,
                chunks = groups.len(),
                "Splitting batch"
            );
            groups
        } else {
            vec![reports]
        };
        let batches = self.make_batches(&batch_id, groups);

        let results = join_all(
            batches
                .into_iter()
                .map(|batch| self.inner.sender.send(batch)),
        )
        .await;

        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Size units waiting for the next flush.
    pub fn pending_units(&self) -> usize {
        lock(&self.inner.pending).units
    }

    /// Reports waiting for the next flush.
    pub fn pending_reports(&self) -> usize {
        lock(&self.inner.pending).reports.len()
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush_now().await {
            warn!(error = %e, kind = e.kind(), "Buffer flush failed");
        }
    }

    fn threshold_reached(&self, units: usize) -> bool {
        let config = &self.inner.config;
        if config.dynamic {
            units > 0 && lock(&self.inner.estimator).estimate(units) >= config.limit_in_bytes()
        } else {
            units >= config.size
        }
    }

    fn make_batches(&self, batch_id: &str, groups: Vec<Vec<RawReport>>) -> Vec<FlushBatch> {
        let estimator = lock(&self.inner.estimator).clone();
        let chunks = groups.len();
        groups
            .into_iter()
            .enumerate()
            .map(|(chunk, reports)| {
                let units: usize = reports.iter().map(|r| r.units()).sum();
                FlushBatch {
                    batch_id: batch_id.to_string(),
                    chunk,
                    chunks,
                    reports,
                    estimated_bytes: estimator.estimate(units),
                    validator: SizeValidator {
                        estimator: self.inner.estimator.clone(),
                        max_payload_bytes: self.inner.config.max_payload_bytes,
                    },
                }
            })
            .collect()
    }
}

/// Smallest split of `reports` whose groups are each estimated at or under
/// `limit`, searched upward from `ceil(estimate / limit)` groups.
///
/// Stops at one group per unit; if single units are still over the limit
/// the sender's size validation has the final say.
fn plan_chunks(
    reports: Vec<RawReport>,
    units: usize,
    estimator: &SizeEstimator,
    limit: usize,
) -> Vec<Vec<RawReport>> {
    let max_chunks = units.max(1);
    let mut num_of_chunks = estimator.estimate(units).div_ceil(limit).clamp(1, max_chunks);

    loop {
        let groups = split_batch(reports.clone(), num_of_chunks);
        let fits = groups.iter().all(|group| {
            let group_units: usize = group.iter().map(|r| r.units()).sum();
            estimator.estimate(group_units) <= limit
        });
        if fits || num_of_chunks >= max_chunks {
            return groups;
        }
        num_of_chunks += 1;
    }
}

/// Pack `reports` into at most `num_of_chunks` groups of similar unit count.
///
/// Each report is split into `min(num_of_chunks, units)` chunks and every
/// chunk is placed in the lightest group. Empty groups are dropped.
pub fn split_batch(reports: Vec<RawReport>, num_of_chunks: usize) -> Vec<Vec<RawReport>> {
    let num_of_chunks = num_of_chunks.max(1);
    let mut groups: Vec<(usize, Vec<RawReport>)> =
        (0..num_of_chunks).map(|_| (0, Vec::new())).collect();

    for report in reports {
        let pieces = num_of_chunks.min(report.units()).max(1);
        let chunks = if pieces > 1 {
            split_report(report, pieces)
        } else {
            vec![report]
        };

        for chunk in chunks {
            let lightest = (0..groups.len())
                .min_by_key(|&i| groups[i].0)
                .unwrap_or(0);
            groups[lightest].0 += chunk.units();
            groups[lightest].1.push(chunk);
        }
    }

    groups
        .into_iter()
        .filter(|(_, reports)| !reports.is_empty())
        .map(|(_, reports)| reports)
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
