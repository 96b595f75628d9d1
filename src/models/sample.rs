// Raw sample as produced by the ingestion source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: i64 = 60_000;

/// One numeric observation. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub value: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: i64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// Start of the UTC minute this sample belongs to.
    pub fn bucket_start(&self) -> DateTime<Utc> {
        minute_floor(self.timestamp)
    }
}

/// Truncate `ts` to the start of its UTC minute (`ts - ts mod 60s`).
/// Pre-epoch instants floor toward negative infinity.
pub fn minute_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floored = ts.timestamp_millis().div_euclid(MS_PER_MINUTE) * MS_PER_MINUTE;
    from_millis(floored)
}

/// Millisecond instant from the database; out-of-range values clamp to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}
