//! Remote sink gateway.
//!
//! The sync coordinator hands each non-empty range to a [`RemoteSink`] in one call. Sinks
//! with a maximum batch size are wrapped in [`ChunkedSink`], which splits the range and
//! stops at the first failed chunk. Delivery is at-least-once: a failed upload is retried
//! in full on the next tick, so sinks must merge re-delivered buckets idempotently.

mod jsonl;

pub use jsonl::JsonlSink;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::models::Bucket;

/// Default maximum number of buckets per sink call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Deliver `buckets` (ascending by `bucket_start`). Ok means every bucket was accepted.
    async fn upload(&self, buckets: &[Bucket]) -> Result<(), SinkError>;

    /// Return the name of this sink, for logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<S: RemoteSink + ?Sized> RemoteSink for Arc<S> {
    async fn upload(&self, buckets: &[Bucket]) -> Result<(), SinkError> {
        (**self).upload(buckets).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Splits uploads into chunks of at most `max_batch_size` buckets, in order.
pub struct ChunkedSink<S> {
    inner: S,
    max_batch_size: usize,
}

impl<S: RemoteSink> ChunkedSink<S> {
    /// `max_batch_size` of 0 is treated as 1.
    pub fn new(inner: S, max_batch_size: usize) -> Self {
        Self {
            inner,
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

#[async_trait]
impl<S: RemoteSink> RemoteSink for ChunkedSink<S> {
    async fn upload(&self, buckets: &[Bucket]) -> Result<(), SinkError> {
        let chunks = buckets.len().div_ceil(self.max_batch_size);
        for (i, chunk) in buckets.chunks(self.max_batch_size).enumerate() {
            if let Err(e) = self.inner.upload(chunk).await {
                tracing::warn!(
                    sink = self.inner.name(),
                    chunk = i + 1,
                    chunks,
                    error = %e,
                    "chunk upload failed; remaining chunks skipped"
                );
                return Err(SinkError::Chunk {
                    chunk: i + 1,
                    chunks,
                    source: Box::new(e),
                });
            }
            tracing::debug!(
                sink = self.inner.name(),
                chunk = i + 1,
                chunks,
                buckets_count = chunk.len(),
                "chunk uploaded"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
