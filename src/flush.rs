// Flush path: move resident buckets from the buffer into the store.
// A drained batch is only forgotten once the store call returns Ok; on a write failure it is
// merged back into the buffer and retried next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::buffer::{AggregationBuffer, Drained};
use crate::error::{Error, Result};
use crate::store::BucketStore;

/// Upper bound on the blocking flush run at shutdown.
pub const MAX_SHUTDOWN_FLUSH: Duration = Duration::from_secs(3);

/// What one flush moved (or tried to move).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub buckets: usize,
    pub samples: usize,
    pub annotations: usize,
}

impl FlushReport {
    fn of(drained: &Drained) -> Self {
        Self {
            buckets: drained.buckets.len(),
            samples: drained.sample_count(),
            annotations: drained.annotations.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets == 0 && self.annotations == 0
    }
}

/// Outcome of the bounded flush run at shutdown.
#[derive(Debug)]
pub enum FinalFlush {
    Flushed(FlushReport),
    Failed { report: FlushReport, error: Error },
    /// The store did not finish in time; this data is lost. If an earlier flush still held
    /// the store when time ran out, nothing was drained and `abandoned` counts what was
    /// left in the buffer instead.
    TimedOut { abandoned: FlushReport },
}

pub struct Flusher {
    buffer: Arc<AggregationBuffer>,
    store: Arc<dyn BucketStore>,
    // One flush at a time, so a restore never races a second drain.
    gate: Mutex<()>,
    buckets_flushed_total: AtomicU64,
    flush_failures_total: AtomicU64,
}

impl Flusher {
    pub fn new(buffer: Arc<AggregationBuffer>, store: Arc<dyn BucketStore>) -> Self {
        Self {
            buffer,
            store,
            gate: Mutex::new(()),
            buckets_flushed_total: AtomicU64::new(0),
            flush_failures_total: AtomicU64::new(0),
        }
    }

    pub fn buffer(&self) -> &Arc<AggregationBuffer> {
        &self.buffer
    }

    /// Drain the buffer and persist it. An empty buffer makes no store calls at all.
    pub async fn flush(&self) -> Result<FlushReport> {
        let _gate = self.gate.lock().await;
        let drained = self.buffer.drain();
        self.persist(drained).await
    }

    /// Flush now, outside the timer schedule.
    pub async fn force_flush(&self) -> Result<FlushReport> {
        self.flush().await
    }

    /// Like [`Flusher::flush`], but returns `None` straight away if another flush is still
    /// running.
    pub async fn try_flush(&self) -> Option<Result<FlushReport>> {
        let _gate = self.gate.try_lock().ok()?;
        let drained = self.buffer.drain();
        Some(self.persist(drained).await)
    }

    /// Final flush at shutdown, bounded by `timeout` (clamped to [`MAX_SHUTDOWN_FLUSH`]).
    /// If the store has not committed by then, the drained data is lost.
    pub async fn shutdown_flush(&self, timeout: Duration) -> FinalFlush {
        let timeout = timeout.min(MAX_SHUTDOWN_FLUSH);
        let mut in_flight: Option<FlushReport> = None;
        let work = async {
            let _gate = self.gate.lock().await;
            let drained = self.buffer.drain();
            in_flight = Some(FlushReport::of(&drained));
            self.persist(drained).await
        };
        let outcome = tokio::time::timeout(timeout, work).await;

        match (outcome, in_flight) {
            (Ok(Ok(report)), _) => FinalFlush::Flushed(report),
            (Ok(Err(error)), in_flight) => {
                tracing::warn!(error = %error, "final flush failed");
                FinalFlush::Failed {
                    report: in_flight.unwrap_or_default(),
                    error,
                }
            }
            (Err(_), Some(abandoned)) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    buckets_count = abandoned.buckets,
                    samples_count = abandoned.samples,
                    annotations_count = abandoned.annotations,
                    "final flush timed out; drained buckets are lost"
                );
                FinalFlush::TimedOut { abandoned }
            }
            (Err(_), None) => {
                let abandoned = FlushReport {
                    buckets: self.buffer.len(),
                    samples: self.buffer.sample_count(),
                    annotations: self.buffer.pending_annotations(),
                };
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    buckets_count = abandoned.buckets,
                    samples_count = abandoned.samples,
                    annotations_count = abandoned.annotations,
                    "final flush timed out behind an earlier flush; buffer was never drained"
                );
                FinalFlush::TimedOut { abandoned }
            }
        }
    }

    pub fn buckets_flushed_total(&self) -> u64 {
        self.buckets_flushed_total.load(Ordering::Relaxed)
    }

    pub fn flush_failures_total(&self) -> u64 {
        self.flush_failures_total.load(Ordering::Relaxed)
    }

    async fn persist(&self, drained: Drained) -> Result<FlushReport> {
        if drained.is_empty() {
            return Ok(FlushReport::default());
        }
        let report = FlushReport::of(&drained);
        let Drained {
            buckets,
            annotations,
        } = drained;

        if !buckets.is_empty() {
            let written = self.store.upsert_batch(&buckets).await;
            if let Err(e) = written {
                self.recover(
                    Drained {
                        buckets,
                        annotations,
                    },
                    &e,
                );
                return Err(e);
            }
        }
        self.buckets_flushed_total
            .fetch_add(buckets.len() as u64, Ordering::Relaxed);

        if !annotations.is_empty() {
            let merged = self.store.merge_annotations(&annotations).await;
            if let Err(e) = merged {
                self.recover(
                    Drained {
                        buckets: Vec::new(),
                        annotations,
                    },
                    &e,
                );
                return Err(e);
            }
        }

        tracing::debug!(
            operation = "flush",
            buckets_count = report.buckets,
            samples_count = report.samples,
            annotations_count = report.annotations,
            "Buckets flushed"
        );
        Ok(report)
    }

    fn recover(&self, drained: Drained, error: &Error) {
        self.flush_failures_total.fetch_add(1, Ordering::Relaxed);
        if error.is_unavailable() {
            // The degraded store never comes back within this process; keeping the data would
            // only grow the buffer without bound.
            tracing::warn!(
                buckets_count = drained.buckets.len(),
                samples_count = drained.sample_count(),
                annotations_count = drained.annotations.len(),
                "store unavailable; dropping drained buckets"
            );
            return;
        }
        tracing::debug!(
            buckets_count = drained.buckets.len(),
            annotations_count = drained.annotations.len(),
            "re-buffering drained data after failed write"
        );
        self.buffer.restore(drained);
    }
}
