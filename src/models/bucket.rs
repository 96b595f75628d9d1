// Minute bucket: every sample whose timestamp floors to `bucket_start`, plus an optional annotation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Sample, minute_floor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub bucket_start: DateTime<Utc>,
    /// Empty until an enrichment arrives.
    #[serde(default)]
    pub annotation: String,
    /// Arrival order while buffered; timestamp order once read back from the store.
    #[serde(default)]
    pub samples: Vec<Sample>,
}

impl Bucket {
    /// Empty bucket for the minute containing `ts`.
    pub fn new(ts: DateTime<Utc>) -> Self {
        Self {
            bucket_start: minute_floor(ts),
            annotation: String::new(),
            samples: Vec::new(),
        }
    }

    /// Annotation-only bucket, used when an enrichment lands before (or without) its samples.
    pub fn placeholder(ts: DateTime<Utc>, annotation: &str) -> Self {
        let mut bucket = Self::new(ts);
        bucket.merge_annotation(annotation);
        bucket
    }

    pub fn accepts(&self, sample: &Sample) -> bool {
        sample.bucket_start() == self.bucket_start
    }

    /// Last writer wins unless the incoming text is empty. Returns true when the annotation changed.
    pub fn merge_annotation(&mut self, incoming: &str) -> bool {
        if !should_overwrite(&self.annotation, incoming) {
            return false;
        }
        self.annotation = incoming.to_owned();
        true
    }

    pub fn is_placeholder(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The one annotation rule used everywhere annotations meet: a non-empty incoming value
/// replaces the current one; an empty incoming value never clobbers anything.
pub fn should_overwrite(current: &str, incoming: &str) -> bool {
    !incoming.is_empty() && current != incoming
}
