// SQLite bucket store. Writes go through one async gate and one transaction each, so the
// engine only ever sees a single writer; reads use the pool directly and read both tables
// inside one transaction so a batch is either fully visible or not at all.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::instrument;

use super::{BucketStore, schema};
use crate::error::{Error, Result};
use crate::models::{Bucket, Sample, from_millis, minute_floor};

pub struct SqliteBucketStore {
    pool: SqlitePool,
    write_gate: Mutex<()>,
}

impl SqliteBucketStore {
    /// Connect to SQLite at `path`, create parent dir and DB if missing, enable WAL + pragmas.
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        Ok(Self {
            pool,
            write_gate: Mutex::new(()),
        })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        schema::init_bucket_tables(&self.pool).await
    }

    async fn write_buckets(&self, buckets: &[Bucket]) -> std::result::Result<(), sqlx::Error> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        for bucket in buckets {
            upsert_bucket_row(&mut tx, bucket).await?;
        }
        tx.commit().await
    }

    async fn write_annotations(
        &self,
        annotations: &BTreeMap<DateTime<Utc>, String>,
    ) -> std::result::Result<(), sqlx::Error> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        for (ts, text) in annotations {
            if text.is_empty() {
                continue;
            }
            sqlx::query(
                "INSERT INTO minute_buckets (bucket_start, annotation) VALUES ($1, $2)
                 ON CONFLICT(bucket_start) DO UPDATE SET annotation = excluded.annotation",
            )
            .bind(minute_floor(*ts).timestamp_millis())
            .bind(text)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    async fn read_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> std::result::Result<Vec<Bucket>, sqlx::Error> {
        let from_ts = start.timestamp_millis();
        let to_ts = end.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let minute_rows = sqlx::query(
            "SELECT id, bucket_start, annotation FROM minute_buckets
             WHERE bucket_start >= $1 AND bucket_start <= $2
             ORDER BY bucket_start ASC",
        )
        .bind(from_ts)
        .bind(to_ts)
        .fetch_all(&mut *tx)
        .await?;

        let sample_rows = sqlx::query(
            "SELECT s.minute_id, s.value, s.timestamp FROM samples s
             JOIN minute_buckets m ON m.id = s.minute_id
             WHERE m.bucket_start >= $1 AND m.bucket_start <= $2
             ORDER BY s.minute_id ASC, s.timestamp ASC, s.id ASC",
        )
        .bind(from_ts)
        .bind(to_ts)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut out = Vec::with_capacity(minute_rows.len());
        let mut index_by_id = HashMap::with_capacity(minute_rows.len());
        for row in minute_rows {
            let id: i64 = row.try_get("id")?;
            let bucket_start: i64 = row.try_get("bucket_start")?;
            let annotation: Option<String> = row.try_get("annotation")?;
            index_by_id.insert(id, out.len());
            out.push(Bucket {
                bucket_start: from_millis(bucket_start),
                annotation: annotation.unwrap_or_default(),
                samples: Vec::new(),
            });
        }
        for row in sample_rows {
            let minute_id: i64 = row.try_get("minute_id")?;
            let value: i64 = row.try_get("value")?;
            let timestamp: i64 = row.try_get("timestamp")?;
            if let Some(&i) = index_by_id.get(&minute_id) {
                out[i].samples.push(Sample::new(value, from_millis(timestamp)));
            }
        }
        Ok(out)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> std::result::Result<u64, sqlx::Error> {
        let cutoff_ts = cutoff.timestamp_millis();
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM samples WHERE minute_id IN
             (SELECT id FROM minute_buckets WHERE bucket_start < $1)",
        )
        .bind(cutoff_ts)
        .execute(&mut *tx)
        .await?;
        let r = sqlx::query("DELETE FROM minute_buckets WHERE bucket_start < $1")
            .bind(cutoff_ts)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(r.rows_affected())
    }
}

/// Empty annotations bind as NULL so `COALESCE` keeps whatever is stored.
async fn upsert_bucket_row(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
) -> std::result::Result<(), sqlx::Error> {
    let annotation = Some(bucket.annotation.as_str()).filter(|a| !a.is_empty());
    let minute_id: i64 = sqlx::query_scalar(
        "INSERT INTO minute_buckets (bucket_start, annotation) VALUES ($1, $2)
         ON CONFLICT(bucket_start) DO UPDATE
         SET annotation = COALESCE(excluded.annotation, minute_buckets.annotation)
         RETURNING id",
    )
    .bind(bucket.bucket_start.timestamp_millis())
    .bind(annotation)
    .fetch_one(&mut *conn)
    .await?;

    for sample in &bucket.samples {
        sqlx::query("INSERT INTO samples (minute_id, value, timestamp) VALUES ($1, $2, $3)")
            .bind(minute_id)
            .bind(sample.value)
            .bind(sample.timestamp.timestamp_millis())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    #[instrument(skip(self, bucket), fields(repo = "buckets", operation = "upsert_bucket", bucket_start = %bucket.bucket_start))]
    async fn upsert_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.write_buckets(std::slice::from_ref(bucket))
            .await
            .map_err(Error::WriteFailed)
    }

    #[instrument(skip(self, buckets), fields(repo = "buckets", operation = "upsert_batch", buckets_count = buckets.len()))]
    async fn upsert_batch(&self, buckets: &[Bucket]) -> Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        self.write_buckets(buckets)
            .await
            .map_err(Error::WriteFailed)
    }

    #[instrument(skip(self, annotations), fields(repo = "buckets", operation = "merge_annotations", annotations_count = annotations.len()))]
    async fn merge_annotations(
        &self,
        annotations: &BTreeMap<DateTime<Utc>, String>,
    ) -> Result<()> {
        if annotations.is_empty() {
            return Ok(());
        }
        self.write_annotations(annotations)
            .await
            .map_err(Error::WriteFailed)
    }

    #[instrument(skip(self), fields(repo = "buckets", operation = "query_range"))]
    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Bucket>> {
        self.read_range(start, end).await.map_err(Error::QueryFailed)
    }

    #[instrument(skip(self), fields(repo = "buckets", operation = "prune_before"))]
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.delete_before(cutoff).await.map_err(Error::WriteFailed)
    }
}
