// Stand-in used when the database could not be opened. Rejects everything immediately.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::BucketStore;
use crate::error::{Error, Result};
use crate::models::Bucket;

#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(Error::StoreUnavailable(self.reason.clone()))
    }
}

#[async_trait]
impl BucketStore for UnavailableStore {
    async fn upsert_bucket(&self, _bucket: &Bucket) -> Result<()> {
        self.fail()
    }

    async fn upsert_batch(&self, _buckets: &[Bucket]) -> Result<()> {
        self.fail()
    }

    async fn merge_annotations(
        &self,
        _annotations: &BTreeMap<DateTime<Utc>, String>,
    ) -> Result<()> {
        self.fail()
    }

    async fn query_range(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<Bucket>> {
        self.fail()
    }

    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        self.fail()
    }
}
