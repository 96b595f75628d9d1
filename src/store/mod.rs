// Durable bucket storage: the system of record between the buffer and the remote sink.
// SQLite via sqlx. Two tables: one row per minute, one row per sample (see schema.rs).
// If the database cannot be opened the store degrades to `UnavailableStore` instead of
// taking the process down.

mod schema;
mod sqlite;
mod unavailable;

pub use sqlite::SqliteBucketStore;
pub use unavailable::UnavailableStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::Bucket;

#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Insert the bucket, or append its samples to the existing row for `bucket_start`.
    /// A non-empty annotation replaces the stored one; an empty one never does.
    async fn upsert_bucket(&self, bucket: &Bucket) -> Result<()>;

    /// All-or-nothing `upsert_bucket` over `buckets`.
    async fn upsert_batch(&self, buckets: &[Bucket]) -> Result<()>;

    /// Land each annotation on the row for its minute, creating an annotation-only
    /// placeholder row when the minute has no row yet. The buffer hands over at most one
    /// annotation per minute (the latest to arrive); if a map holds several for one minute,
    /// the one with the latest timestamp is kept. Empty text is skipped.
    async fn merge_annotations(&self, annotations: &BTreeMap<DateTime<Utc>, String>)
    -> Result<()>;

    /// Buckets with `start <= bucket_start <= end`, ascending, samples ascending by timestamp.
    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Bucket>>;

    /// Delete buckets (and their samples) with `bucket_start < cutoff`. Returns rows removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Open and initialise the SQLite store at `path`. Never fails: on any error the problem is
/// logged and a store that rejects every call is returned instead.
pub async fn open_store(path: &str) -> Arc<dyn BucketStore> {
    let opened = async {
        let store = SqliteBucketStore::connect(path).await?;
        store.init().await?;
        anyhow::Ok(store)
    }
    .await;

    match opened {
        Ok(store) => {
            tracing::info!(path, "bucket store ready");
            Arc::new(store)
        }
        Err(e) => {
            tracing::error!(
                path,
                error = %e,
                "bucket store unavailable; samples will be buffered but not persisted"
            );
            Arc::new(UnavailableStore::new(format!("{path}: {e}")))
        }
    }
}
