//! Sync checkpoint: the instant up to which buckets have been delivered to the remote sink.
//!
//! Lives outside the bucket tables, in a process-wide JSON settings file, so a store reset
//! or restore never rewinds (or fast-forwards) delivery.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::from_millis;

/// Settings key the checkpoint is stored under.
pub const CHECKPOINT_KEY: &str = "lastSyncedAt";

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` until the first successful sync.
    async fn load(&self) -> Result<Option<DateTime<Utc>>>;

    async fn save(&self, checkpoint: DateTime<Utc>) -> Result<()>;
}

/// Checkpoint kept in a JSON object file alongside other settings. Unknown keys survive saves.
#[derive(Debug, Clone)]
pub struct SettingsFileCheckpoint {
    path: PathBuf,
}

impl SettingsFileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_settings(&self) -> Result<Map<String, Value>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(checkpoint_err(&self.path, e)),
        };
        if bytes.is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(Error::Checkpoint(format!(
                "{}: expected a JSON object, found {}",
                self.path.display(),
                other
            ))),
            Err(e) => Err(checkpoint_err(&self.path, e)),
        }
    }
}

fn checkpoint_err(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Checkpoint(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl CheckpointStore for SettingsFileCheckpoint {
    async fn load(&self) -> Result<Option<DateTime<Utc>>> {
        let settings = self.read_settings().await?;
        match settings.get(CHECKPOINT_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(|ms| Some(from_millis(ms)))
                .ok_or_else(|| checkpoint_err(&self.path, format!("invalid {CHECKPOINT_KEY}: {v}"))),
        }
    }

    async fn save(&self, checkpoint: DateTime<Utc>) -> Result<()> {
        let mut settings = self.read_settings().await?;
        settings.insert(
            CHECKPOINT_KEY.to_owned(),
            Value::from(checkpoint.timestamp_millis()),
        );
        let body = serde_json::to_vec_pretty(&Value::Object(settings))
            .map_err(|e| checkpoint_err(&self.path, e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| checkpoint_err(&self.path, e))?;
        }
        // Write-then-rename so a crash mid-write leaves the previous checkpoint intact.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| checkpoint_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| checkpoint_err(&self.path, e))?;
        Ok(())
    }
}

/// In-process checkpoint, for tests and embedders that persist settings themselves.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    value: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryCheckpoint {
    pub fn new(initial: Option<DateTime<Utc>>) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get())
    }

    async fn save(&self, checkpoint: DateTime<Utc>) -> Result<()> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(checkpoint);
        Ok(())
    }
}
