// Background timers: flush (buffer -> store), sync (store -> sink), retention (prune), stats.
// Each timer hands the I/O to its own task and goes straight back to waiting, so a slow
// store or sink never holds up a tick. Shutdown stops every timer first, then runs one
// bounded flush of whatever is still buffered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, instrument, warn};

use crate::flush::{FinalFlush, Flusher};
use crate::store::BucketStore;
use crate::sync::{SyncCoordinator, SyncOutcome};

/// Shared components the timers drive.
pub struct PipelineDeps {
    pub flusher: Arc<Flusher>,
    pub coordinator: Arc<SyncCoordinator>,
    pub store: Arc<dyn BucketStore>,
}

/// Timer periods and shutdown bound.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub flush_interval: Duration,
    pub sync_interval: Duration,
    pub shutdown_flush_timeout: Duration,
    /// Period of the "pipeline stats" log line.
    pub stats_log_interval: Duration,
    /// `None` disables pruning.
    pub retention: Option<RetentionConfig>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    pub retention_days: u32,
    pub prune_interval: Duration,
}

/// Running pipeline. Dropping it without calling [`PipelineHandle::shutdown`] leaves the
/// timers running until the runtime stops.
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    timers: Vec<JoinHandle<()>>,
    flusher: Arc<Flusher>,
    shutdown_flush_timeout: Duration,
}

impl PipelineHandle {
    pub fn flusher(&self) -> &Arc<Flusher> {
        &self.flusher
    }

    /// Stop the flush, sync and retention timers, then flush what remains in the buffer,
    /// waiting at most the configured shutdown timeout.
    pub async fn shutdown(self) -> FinalFlush {
        let _ = self.shutdown_tx.send(true);
        for timer in self.timers {
            if let Err(e) = timer.await {
                warn!(error = %e, "timer task ended abnormally");
            }
        }
        let outcome = self
            .flusher
            .shutdown_flush(self.shutdown_flush_timeout)
            .await;
        if let FinalFlush::Flushed(report) = &outcome {
            info!(
                buckets_count = report.buckets,
                samples_count = report.samples,
                "final flush complete"
            );
        }
        outcome
    }
}

pub fn spawn(deps: PipelineDeps, config: SchedulerConfig) -> PipelineHandle {
    let PipelineDeps {
        flusher,
        coordinator,
        store,
    } = deps;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut timers = vec![
        tokio::spawn(flush_timer(
            flusher.clone(),
            config.flush_interval,
            shutdown_rx.clone(),
        )),
        tokio::spawn(sync_timer(
            coordinator.clone(),
            config.sync_interval,
            shutdown_rx.clone(),
        )),
        tokio::spawn(stats_timer(
            flusher.clone(),
            coordinator.clone(),
            config.stats_log_interval,
            shutdown_rx.clone(),
        )),
    ];
    if let Some(retention) = config.retention {
        timers.push(tokio::spawn(retention_timer(
            store,
            coordinator,
            retention,
            shutdown_rx,
        )));
    }

    PipelineHandle {
        shutdown_tx,
        timers,
        flusher,
        shutdown_flush_timeout: config.shutdown_flush_timeout,
    }
}

#[instrument(skip(flusher, shutdown_rx), fields(interval_secs = period.as_secs()))]
async fn flush_timer(
    flusher: Arc<Flusher>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; nothing is buffered yet.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let flusher = flusher.clone();
                tokio::spawn(async move {
                    match flusher.try_flush().await {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, operation = "flush", "scheduled flush failed");
                        }
                        None => {
                            tracing::debug!("previous flush still running; tick skipped");
                        }
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!("flush timer stopped");
                break;
            }
        }
    }
}

#[instrument(skip(coordinator, shutdown_rx), fields(interval_secs = period.as_secs()))]
async fn sync_timer(
    coordinator: Arc<SyncCoordinator>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    match coordinator.tick().await {
                        Ok(SyncOutcome::Skipped) => {
                            tracing::debug!("previous sync still running; tick skipped");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, operation = "sync", "sync tick failed; range will be retried");
                        }
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!("sync timer stopped");
                break;
            }
        }
    }
}

#[instrument(skip(flusher, coordinator, shutdown_rx), fields(interval_secs = period.as_secs()))]
async fn stats_timer(
    flusher: Arc<Flusher>,
    coordinator: Arc<SyncCoordinator>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let stats = PipelineStats::collect(&flusher, &coordinator);
                info!(
                    buffered_buckets = stats.buffered_buckets,
                    pending_annotations = stats.pending_annotations,
                    buckets_flushed_total = stats.buckets_flushed_total,
                    flush_failures_total = stats.flush_failures_total,
                    buckets_synced_total = stats.buckets_synced_total,
                    "pipeline stats"
                );
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!("stats timer stopped");
                break;
            }
        }
    }
}

/// Counters reported by the stats timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub buffered_buckets: usize,
    pub pending_annotations: usize,
    pub buckets_flushed_total: u64,
    pub flush_failures_total: u64,
    pub buckets_synced_total: u64,
}

impl PipelineStats {
    pub fn collect(flusher: &Flusher, coordinator: &SyncCoordinator) -> Self {
        let buffer = flusher.buffer();
        Self {
            buffered_buckets: buffer.len(),
            pending_annotations: buffer.pending_annotations(),
            buckets_flushed_total: flusher.buckets_flushed_total(),
            flush_failures_total: flusher.flush_failures_total(),
            buckets_synced_total: coordinator.buckets_synced_total(),
        }
    }
}

/// Deletes buckets older than the retention window, but never anything the next sync will
/// still read: undelivered buckets stay until they have reached the sink.
#[instrument(skip(store, coordinator, shutdown_rx), fields(retention_days = config.retention_days))]
async fn retention_timer(
    store: Arc<dyn BucketStore>,
    coordinator: Arc<SyncCoordinator>,
    config: RetentionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(config.prune_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let store = store.clone();
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = prune_once(store.as_ref(), &coordinator, config.retention_days).await {
                        warn!(error = %e, operation = "prune_before", "Failed to prune old buckets");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!("retention timer stopped");
                break;
            }
        }
    }
}

/// One retention pass. Returns the number of minute rows removed.
pub async fn prune_once(
    store: &dyn BucketStore,
    coordinator: &SyncCoordinator,
    retention_days: u32,
) -> crate::error::Result<u64> {
    let retention_cutoff = Utc::now() - TimeDelta::days(i64::from(retention_days));
    let cutoff = retention_cutoff.min(coordinator.window_start().await?);
    let removed = store.prune_before(cutoff).await?;
    if removed > 0 {
        info!(removed_buckets = removed, %cutoff, "old buckets pruned");
    }
    Ok(removed)
}
