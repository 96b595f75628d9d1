// Scheduler tests: timers drive flush and sync end to end, shutdown flushes leftovers, retention

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use common::{RecordingSink, temp_store, values};
use samplesync::buffer::AggregationBuffer;
use samplesync::checkpoint::MemoryCheckpoint;
use samplesync::flush::{FinalFlush, Flusher};
use samplesync::models::{Bucket, Sample};
use samplesync::scheduler::{
    self, PipelineDeps, PipelineStats, RetentionConfig, SchedulerConfig, prune_once,
};
use samplesync::store::{BucketStore, SqliteBucketStore};
use samplesync::sync::SyncCoordinator;

struct Harness {
    buffer: Arc<AggregationBuffer>,
    store: Arc<SqliteBucketStore>,
    sink: Arc<RecordingSink>,
    checkpoint: Arc<MemoryCheckpoint>,
    deps: PipelineDeps,
}

fn harness(store: Arc<SqliteBucketStore>, checkpoint: MemoryCheckpoint) -> Harness {
    let buffer = Arc::new(AggregationBuffer::new());
    let sink = RecordingSink::new();
    let checkpoint = Arc::new(checkpoint);
    let flusher = Arc::new(Flusher::new(buffer.clone(), store.clone()));
    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        sink.clone(),
        checkpoint.clone(),
    ));
    let deps = PipelineDeps {
        flusher,
        coordinator,
        store: store.clone(),
    };
    Harness {
        buffer,
        store,
        sink,
        checkpoint,
        deps,
    }
}

fn config(flush_ms: u64, sync_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        flush_interval: Duration::from_millis(flush_ms),
        sync_interval: Duration::from_millis(sync_ms),
        shutdown_flush_timeout: Duration::from_secs(3),
        stats_log_interval: Duration::from_millis(50),
        retention: None,
    }
}

#[tokio::test]
async fn timers_flush_then_sync_recorded_samples() {
    let (_dir, store) = temp_store().await;
    let h = harness(store, MemoryCheckpoint::default());

    let recorded_at = Utc::now() - TimeDelta::minutes(2);
    h.buffer.record(Sample::new(42, recorded_at));
    h.buffer.record(Sample::new(7, recorded_at));
    h.buffer.annotate(recorded_at, "ok");

    // Flush runs well before the first sync tick.
    let pipeline = scheduler::spawn(h.deps, config(20, 250));
    tokio::time::sleep(Duration::from_millis(600)).await;
    let outcome = pipeline.shutdown().await;
    assert!(matches!(outcome, FinalFlush::Flushed(report) if report.is_empty()));

    assert!(h.buffer.is_empty());
    let stored = h
        .store
        .query_range(recorded_at - TimeDelta::minutes(1), Utc::now())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(values(&stored[0]), vec![42, 7]);
    assert_eq!(stored[0].annotation, "ok");

    let synced: Vec<Bucket> = h.sink.uploads().into_iter().flatten().collect();
    assert_eq!(synced, stored);
    assert!(h.checkpoint.get().unwrap() > recorded_at);
}

#[tokio::test]
async fn shutdown_flushes_what_the_timer_has_not_reached() {
    let (_dir, store) = temp_store().await;
    let h = harness(store, MemoryCheckpoint::default());
    let pipeline = scheduler::spawn(h.deps, config(3_600_000, 3_600_000));

    let now = Utc::now();
    h.buffer.record(Sample::new(1, now));
    h.buffer.record(Sample::new(2, now));

    match pipeline.shutdown().await {
        FinalFlush::Flushed(report) => {
            assert_eq!(report.buckets, 1);
            assert_eq!(report.samples, 2);
        }
        other => panic!("expected Flushed, got {other:?}"),
    }
    let stored = h
        .store
        .query_range(now - TimeDelta::minutes(1), now)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(values(&stored[0]), vec![1, 2]);
    // The final flush never triggers a sync.
    assert_eq!(h.sink.calls(), 0);
}

#[tokio::test]
async fn flusher_is_reachable_through_the_handle() {
    let (_dir, store) = temp_store().await;
    let h = harness(store, MemoryCheckpoint::default());
    let pipeline = scheduler::spawn(h.deps, config(3_600_000, 3_600_000));

    let now = Utc::now();
    h.buffer.record(Sample::new(5, now));
    let report = pipeline.flusher().force_flush().await.unwrap();
    assert_eq!(report.buckets, 1);

    match pipeline.shutdown().await {
        FinalFlush::Flushed(report) => assert!(report.is_empty()),
        other => panic!("expected Flushed, got {other:?}"),
    }
}

fn old_and_recent() -> Vec<Bucket> {
    let now = Utc::now();
    let mut old = Bucket::new(now - TimeDelta::days(40));
    old.samples.push(Sample::new(1, old.bucket_start));
    let mut recent = Bucket::new(now - TimeDelta::days(1));
    recent.samples.push(Sample::new(2, recent.bucket_start));
    vec![old, recent]
}

#[tokio::test]
async fn prune_once_removes_only_buckets_past_retention() {
    let (_dir, store) = temp_store().await;
    store.upsert_batch(&old_and_recent()).await.unwrap();
    let h = harness(store, MemoryCheckpoint::new(Some(Utc::now())));

    let removed = prune_once(h.store.as_ref(), &h.deps.coordinator, 30)
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let left = h
        .store
        .query_range(Utc::now() - TimeDelta::days(365), Utc::now())
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(values(&left[0]), vec![2]);
}

#[tokio::test]
async fn prune_once_never_passes_the_checkpoint() {
    let (_dir, store) = temp_store().await;
    store.upsert_batch(&old_and_recent()).await.unwrap();
    // Nothing has been delivered yet.
    let h = harness(store, MemoryCheckpoint::default());

    let removed = prune_once(h.store.as_ref(), &h.deps.coordinator, 30)
        .await
        .unwrap();
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn retention_timer_prunes_on_start() {
    let (_dir, store) = temp_store().await;
    store.upsert_batch(&old_and_recent()).await.unwrap();
    let h = harness(store, MemoryCheckpoint::new(Some(Utc::now())));

    let mut cfg = config(3_600_000, 3_600_000);
    cfg.retention = Some(RetentionConfig {
        retention_days: 30,
        prune_interval: Duration::from_secs(3600),
    });
    let pipeline = scheduler::spawn(h.deps, cfg);
    tokio::time::sleep(Duration::from_millis(300)).await;
    pipeline.shutdown().await;

    let left = h
        .store
        .query_range(Utc::now() - TimeDelta::days(365), Utc::now())
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
}

#[tokio::test]
async fn pipeline_stats_track_flush_and_sync_counters() {
    let (_dir, store) = temp_store().await;
    let h = harness(store, MemoryCheckpoint::default());
    let flusher = h.deps.flusher.clone();
    let coordinator = h.deps.coordinator.clone();

    let now = Utc::now();
    h.buffer.record(Sample::new(1, now));
    h.buffer.annotate(now + TimeDelta::minutes(5), "later");
    let before = PipelineStats::collect(&flusher, &coordinator);
    assert_eq!(before.buffered_buckets, 1);
    assert_eq!(before.pending_annotations, 1);
    assert_eq!(before.buckets_flushed_total, 0);

    flusher.flush().await.unwrap();
    coordinator.tick_at(now + TimeDelta::minutes(10)).await.unwrap();

    let after = PipelineStats::collect(&flusher, &coordinator);
    assert_eq!(
        after,
        PipelineStats {
            buffered_buckets: 0,
            pending_annotations: 0,
            buckets_flushed_total: 1,
            flush_failures_total: 0,
            // The real bucket plus the annotation placeholder.
            buckets_synced_total: 2,
        }
    );

    // The stats timer runs alongside the others and stops with them.
    let pipeline = scheduler::spawn(h.deps, config(3_600_000, 3_600_000));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(matches!(pipeline.shutdown().await, FinalFlush::Flushed(_)));
}
