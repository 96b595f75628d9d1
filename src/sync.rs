//! Sync coordinator: forwards newly persisted buckets to the remote sink.
//!
//! Each tick saves `now` as the new checkpoint once the sink accepted the range (or the range
//! was empty), so a failed tick re-delivers the same range next time. At most one sync runs at
//! a time; a tick that finds one in flight is dropped rather than queued.
//!
//! The read window does not start at the checkpoint itself. A minute keeps receiving samples
//! after a tick has covered part of it, and a sample reaches the store only on the next
//! flush, so each tick re-reads from the start of the minute that was current `flush_lag`
//! before the checkpoint. Those minutes are delivered again whole; sinks merge by
//! `bucketStart`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::models::minute_floor;
use crate::sink::RemoteSink;
use crate::store::BucketStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another sync was already in flight.
    Skipped,
    /// Nothing in range; checkpoint advanced to `end` without calling the sink.
    Empty { end: DateTime<Utc> },
    /// `buckets` delivered; checkpoint advanced to `end`.
    Uploaded { end: DateTime<Utc>, buckets: usize },
}

pub struct SyncCoordinator {
    store: Arc<dyn BucketStore>,
    sink: Arc<dyn RemoteSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    flush_lag: Duration,
    syncing: AtomicBool,
    buckets_synced_total: AtomicU64,
}

/// Returns the coordinator to Idle however the tick ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn BucketStore>,
        sink: Arc<dyn RemoteSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            store,
            sink,
            checkpoints,
            flush_lag: Duration::ZERO,
            syncing: AtomicBool::new(false),
            buckets_synced_total: AtomicU64::new(0),
        }
    }

    /// How long a sample may sit in the buffer before it is in the store: a flush interval,
    /// plus however many retries should still be covered.
    pub fn with_flush_lag(mut self, flush_lag: Duration) -> Self {
        self.flush_lag = flush_lag;
        self
    }

    pub fn state(&self) -> SyncState {
        if self.syncing.load(Ordering::Acquire) {
            SyncState::Syncing
        } else {
            SyncState::Idle
        }
    }

    pub fn buckets_synced_total(&self) -> u64 {
        self.buckets_synced_total.load(Ordering::Relaxed)
    }

    /// Current checkpoint; the Unix epoch before the first successful sync.
    pub async fn checkpoint(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .checkpoints
            .load()
            .await?
            .unwrap_or(DateTime::UNIX_EPOCH))
    }

    /// Where the next tick starts reading: the start of the minute `flush_lag` before the
    /// checkpoint. Nothing before this instant will be read again.
    pub async fn window_start(&self) -> Result<DateTime<Utc>> {
        let checkpoint = self.checkpoint().await?;
        let lag = TimeDelta::from_std(self.flush_lag).unwrap_or(TimeDelta::MAX);
        Ok(match checkpoint.checked_sub_signed(lag) {
            Some(rewound) => minute_floor(rewound),
            None => DateTime::<Utc>::MIN_UTC,
        })
    }

    pub async fn tick(&self) -> Result<SyncOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// One sync pass with `now` as the end of the range.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<SyncOutcome> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sync already in flight; skipping tick");
            return Ok(SyncOutcome::Skipped);
        }
        let _idle = SyncingGuard(&self.syncing);

        let start = self.window_start().await?;
        let end = now;
        let buckets = self.store.query_range(start, end).await?;

        if buckets.is_empty() {
            self.checkpoints.save(end).await?;
            tracing::debug!(%start, %end, "nothing to sync; checkpoint advanced");
            return Ok(SyncOutcome::Empty { end });
        }

        self.sink.upload(&buckets).await.map_err(Error::UploadFailed)?;
        self.checkpoints.save(end).await?;
        self.buckets_synced_total
            .fetch_add(buckets.len() as u64, Ordering::Relaxed);
        tracing::info!(
            sink = self.sink.name(),
            %start,
            %end,
            buckets_count = buckets.len(),
            "buckets synced"
        );
        Ok(SyncOutcome::Uploaded {
            end,
            buckets: buckets.len(),
        })
    }
}
