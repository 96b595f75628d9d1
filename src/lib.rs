// Library for the binary and tests: buffer -> store -> sink pipeline.

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod flush;
pub mod models;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
