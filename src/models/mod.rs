// Domain models shared by the buffer, store and sync paths.

mod bucket;
mod sample;

pub use bucket::{Bucket, should_overwrite};
pub use sample::{Sample, from_millis, minute_floor};
