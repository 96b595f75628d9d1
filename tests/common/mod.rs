// Shared test helpers: timestamps, a temp SQLite store, and in-memory fakes for the sink and store.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use samplesync::error::{Error, Result, SinkError};
use samplesync::models::Bucket;
use samplesync::sink::RemoteSink;
use samplesync::store::{BucketStore, SqliteBucketStore};
use tempfile::TempDir;

/// 2024-05-01T12:00:00Z, the start of a minute.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// `t0() + secs` seconds.
pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::TimeDelta::seconds(secs)
}

pub async fn temp_store() -> (TempDir, Arc<SqliteBucketStore>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("samples.db");
    let store = SqliteBucketStore::connect(path.to_str().unwrap())
        .await
        .unwrap();
    store.init().await.unwrap();
    (dir, Arc::new(store))
}

pub fn values(bucket: &Bucket) -> Vec<i64> {
    bucket.samples.iter().map(|s| s.value).collect()
}

/// Records every upload; fails while `failing` is set.
#[derive(Default)]
pub struct RecordingSink {
    pub uploads: Mutex<Vec<Vec<Bucket>>>,
    pub failing: AtomicBool,
    pub calls: AtomicUsize,
    /// Fail only the n-th call (1-based) when set.
    pub fail_on_call: Mutex<Option<usize>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<Vec<Bucket>> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSink for RecordingSink {
    async fn upload(&self, buckets: &[Bucket]) -> std::result::Result<(), SinkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_this = *self.fail_on_call.lock().unwrap() == Some(call);
        if self.failing.load(Ordering::SeqCst) || fail_this {
            return Err(SinkError::Rejected {
                sink: "recording".into(),
                reason: "remote unavailable".into(),
            });
        }
        self.uploads.lock().unwrap().push(buckets.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Counts calls and keeps everything in memory. Writes fail while `failing_writes` is set,
/// annotation merges also while `failing_annotations` is set; every write sleeps `delay` first.
#[derive(Default)]
pub struct CountingStore {
    pub mutating_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub failing_writes: AtomicBool,
    pub failing_annotations: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
    pub batches: Mutex<Vec<Vec<Bucket>>>,
    pub annotations: Mutex<Vec<BTreeMap<DateTime<Utc>, String>>>,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mutating_calls(&self) -> usize {
        self.mutating_calls.load(Ordering::SeqCst)
    }

    async fn before_write(&self) -> Result<()> {
        self.mutating_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(Error::WriteFailed(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for CountingStore {
    async fn upsert_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.before_write().await?;
        self.batches.lock().unwrap().push(vec![bucket.clone()]);
        Ok(())
    }

    async fn upsert_batch(&self, buckets: &[Bucket]) -> Result<()> {
        self.before_write().await?;
        self.batches.lock().unwrap().push(buckets.to_vec());
        Ok(())
    }

    async fn merge_annotations(&self, annotations: &BTreeMap<DateTime<Utc>, String>) -> Result<()> {
        self.before_write().await?;
        if self.failing_annotations.load(Ordering::SeqCst) {
            return Err(Error::WriteFailed(sqlx::Error::PoolTimedOut));
        }
        self.annotations.lock().unwrap().push(annotations.clone());
        Ok(())
    }

    async fn query_range(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<Bucket>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        self.before_write().await?;
        Ok(0)
    }
}
