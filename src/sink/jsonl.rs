// Local outbox sink: appends one JSON line per bucket. Re-delivered buckets simply appear
// again; readers merge lines by `bucketStart`.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::RemoteSink;
use crate::error::SinkError;
use crate::models::Bucket;

pub struct JsonlSink {
    path: PathBuf,
    // Serialises appends so concurrent uploads never interleave lines.
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RemoteSink for JsonlSink {
    async fn upload(&self, buckets: &[Bucket]) -> Result<(), SinkError> {
        let mut body = Vec::new();
        for bucket in buckets {
            serde_json::to_writer(&mut body, bucket)?;
            body.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&body).await?;
        file.sync_data().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}
