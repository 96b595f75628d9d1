//! Error taxonomy for the ingestion, flush and sync paths.
//!
//! None of these are fatal: ingestion never surfaces them, and the scheduled flush and
//! sync tasks log them and retry on their next tick.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The store could not be opened; every call on the degraded store fails fast with this.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A write transaction did not commit. Nothing from it is visible.
    #[error("write failed: {0}")]
    WriteFailed(#[source] sqlx::Error),

    /// A range read failed.
    #[error("query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// The remote sink rejected an upload (or one of its chunks).
    #[error("upload failed: {0}")]
    UploadFailed(#[from] SinkError),

    /// The sync checkpoint could not be read or written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`crate::sink::RemoteSink`].
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink `{sink}` rejected upload: {reason}")]
    Rejected { sink: String, reason: String },

    /// Chunk `chunk` (1-based) of `chunks` failed; earlier chunks may already be on the sink.
    #[error("chunk {chunk} of {chunks} failed: {source}")]
    Chunk {
        chunk: usize,
        chunks: usize,
        #[source]
        source: Box<SinkError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}
