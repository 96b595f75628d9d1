// In-memory aggregation buffer. Ingestion writers and the flush path meet here.
// Two maps (resident buckets, pending annotations) sit behind one mutex, so an annotation can
// arrive before, during or after its samples. For any minute the latest annotation to arrive
// wins, whichever map it landed in.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::{Bucket, Sample, minute_floor};

#[derive(Debug, Default)]
struct BufferState {
    /// Resident buckets keyed by minute start.
    buckets: BTreeMap<DateTime<Utc>, Bucket>,
    /// Annotations for minutes that were not resident when they arrived, keyed by the
    /// original (unfloored) timestamp. At most one entry per minute, never for a resident
    /// minute: the latest arrival replaces any earlier one.
    pending: BTreeMap<DateTime<Utc>, String>,
}

impl BufferState {
    /// Remove the pending annotation for the minute starting at `minute`, if any.
    fn take_pending(&mut self, minute: DateTime<Utc>) -> Option<String> {
        let ts = self
            .pending
            .range(minute..minute + TimeDelta::minutes(1))
            .map(|(ts, _)| *ts)
            .next()?;
        self.pending.remove(&ts)
    }
}

/// Everything removed from the buffer by one [`AggregationBuffer::drain`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Drained {
    /// Ascending by `bucket_start`, samples in arrival order.
    pub buckets: Vec<Bucket>,
    /// Annotations with no drained bucket to land on; merged into the store by timestamp.
    pub annotations: BTreeMap<DateTime<Utc>, String>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.annotations.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.buckets.iter().map(|b| b.samples.len()).sum()
    }
}

#[derive(Debug, Default)]
pub struct AggregationBuffer {
    state: Mutex<BufferState>,
}

impl AggregationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the maps half-updated (every mutation is a
    // single insert or push), so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `sample` to the bucket for its minute, creating the bucket if needed.
    pub fn record(&self, sample: Sample) {
        let key = sample.bucket_start();
        let mut state = self.lock();
        if let Some(bucket) = state.buckets.get_mut(&key) {
            bucket.samples.push(sample);
            return;
        }
        let mut bucket = Bucket::new(key);
        if let Some(text) = state.take_pending(key) {
            bucket.annotation = text;
        }
        bucket.samples.push(sample);
        state.buckets.insert(key, bucket);
    }

    /// Attach `text` to the bucket owning `timestamp`. If that bucket is not resident the
    /// annotation is parked until the next drain, replacing any parked earlier for the same
    /// minute. Empty text never overwrites anything.
    pub fn annotate(&self, timestamp: DateTime<Utc>, text: &str) {
        if text.is_empty() {
            tracing::debug!(%timestamp, "ignoring empty annotation");
            return;
        }
        let key = minute_floor(timestamp);
        let mut state = self.lock();
        if let Some(bucket) = state.buckets.get_mut(&key) {
            bucket.merge_annotation(text);
            return;
        }
        state.take_pending(key);
        state.pending.insert(timestamp, text.to_owned());
    }

    /// Take every resident bucket and pending annotation, leaving the buffer empty.
    ///
    /// Pending annotations never share a minute with a resident bucket (they are folded in
    /// when the bucket is created), so they come back untouched, one per minute.
    pub fn drain(&self) -> Drained {
        let BufferState { buckets, pending } = std::mem::take(&mut *self.lock());
        Drained {
            buckets: buckets.into_values().collect(),
            annotations: pending,
        }
    }

    /// Put a drained batch back after a failed flush so the next cycle retries it.
    ///
    /// Drained samples are older than anything recorded since the drain, so they go first.
    /// Anything annotated since the drain is newer and wins; a drained annotation only fills
    /// a minute that has none.
    pub fn restore(&self, drained: Drained) {
        let mut state = self.lock();
        for mut bucket in drained.buckets {
            let key = bucket.bucket_start;
            if let Some(newer) = state.buckets.remove(&key) {
                bucket.samples.extend(newer.samples);
                bucket.merge_annotation(&newer.annotation);
            } else if let Some(text) = state.take_pending(key) {
                bucket.merge_annotation(&text);
            }
            state.buckets.insert(key, bucket);
        }
        for (ts, text) in drained.annotations {
            let key = minute_floor(ts);
            if let Some(bucket) = state.buckets.get_mut(&key) {
                if bucket.annotation.is_empty() {
                    bucket.annotation = text;
                }
                continue;
            }
            let parked_since = state
                .pending
                .range(key..key + TimeDelta::minutes(1))
                .next()
                .is_some();
            if !parked_since {
                state.pending.insert(ts, text);
            }
        }
    }

    /// Number of resident buckets.
    pub fn len(&self) -> usize {
        self.lock().buckets.len()
    }

    /// Number of samples across resident buckets.
    pub fn sample_count(&self) -> usize {
        self.lock().buckets.values().map(|b| b.samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.buckets.is_empty() && state.pending.is_empty()
    }

    pub fn pending_annotations(&self) -> usize {
        self.lock().pending.len()
    }
}
