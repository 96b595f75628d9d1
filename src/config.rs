use std::time::Duration;

use serde::Deserialize;

use crate::flush::MAX_SHUTDOWN_FLUSH;
use crate::scheduler::{RetentionConfig, SchedulerConfig};
use crate::sink::DEFAULT_MAX_BATCH_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub flush: FlushConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub stats: StatsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    pub interval_secs: u64,
    /// Bound on the blocking flush at shutdown; at most 3000.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_shutdown_timeout_ms() -> u64 {
    MAX_SHUTDOWN_FLUSH.as_millis() as u64
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Settings file holding the sync checkpoint.
    pub checkpoint_path: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Where the bundled JSON-lines sink appends delivered buckets.
    pub output_path: String,
    /// How far behind the checkpoint each sync starts re-reading. Defaults to two flush
    /// intervals (one flush plus one retry).
    pub flush_lag_secs: Option<u64>,
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSection {
    /// 0 keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsSection {
    #[serde(default = "default_stats_log_interval_secs")]
    pub log_interval_secs: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

fn default_stats_log_interval_secs() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    30
}

fn default_prune_interval_secs() -> u64 {
    3600
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.flush.interval_secs > 0,
            "flush.interval_secs must be > 0, got {}",
            self.flush.interval_secs
        );
        anyhow::ensure!(
            (1..=default_shutdown_timeout_ms()).contains(&self.flush.shutdown_timeout_ms),
            "flush.shutdown_timeout_ms must be between 1 and {}, got {}",
            default_shutdown_timeout_ms(),
            self.flush.shutdown_timeout_ms
        );
        anyhow::ensure!(
            self.sync.interval_secs > 0,
            "sync.interval_secs must be > 0, got {}",
            self.sync.interval_secs
        );
        anyhow::ensure!(
            !self.sync.checkpoint_path.is_empty(),
            "sync.checkpoint_path must be non-empty"
        );
        anyhow::ensure!(
            self.sync.max_batch_size > 0,
            "sync.max_batch_size must be > 0, got {}",
            self.sync.max_batch_size
        );
        anyhow::ensure!(
            !self.sync.output_path.is_empty(),
            "sync.output_path must be non-empty"
        );
        anyhow::ensure!(
            self.retention.prune_interval_secs > 0,
            "retention.prune_interval_secs must be > 0, got {}",
            self.retention.prune_interval_secs
        );
        anyhow::ensure!(
            self.stats.log_interval_secs > 0,
            "stats.log_interval_secs must be > 0, got {}",
            self.stats.log_interval_secs
        );
        Ok(())
    }

    /// Re-read window behind the sync checkpoint.
    pub fn flush_lag(&self) -> Duration {
        let secs = self
            .sync
            .flush_lag_secs
            .unwrap_or(self.flush.interval_secs.saturating_mul(2));
        Duration::from_secs(secs)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        let retention = (self.retention.retention_days > 0).then(|| RetentionConfig {
            retention_days: self.retention.retention_days,
            prune_interval: Duration::from_secs(self.retention.prune_interval_secs),
        });
        SchedulerConfig {
            flush_interval: Duration::from_secs(self.flush.interval_secs),
            sync_interval: Duration::from_secs(self.sync.interval_secs),
            shutdown_flush_timeout: Duration::from_millis(self.flush.shutdown_timeout_ms),
            stats_log_interval: Duration::from_secs(self.stats.log_interval_secs),
            retention,
        }
    }
}
