use std::sync::Arc;

use anyhow::Result;
use samplesync::buffer::AggregationBuffer;
use samplesync::checkpoint::SettingsFileCheckpoint;
use samplesync::config::AppConfig;
use samplesync::flush::{FinalFlush, Flusher};
use samplesync::scheduler::{self, PipelineDeps};
use samplesync::sink::{ChunkedSink, JsonlSink};
use samplesync::store;
use samplesync::sync::SyncCoordinator;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    tracing::info!(
        "{} {} starting",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let app_config = AppConfig::load()?;

    let buffer = Arc::new(AggregationBuffer::new());
    let bucket_store = store::open_store(&app_config.database.path).await;
    let sink = Arc::new(ChunkedSink::new(
        JsonlSink::new(&app_config.sync.output_path),
        app_config.sync.max_batch_size,
    ));
    let checkpoints = Arc::new(SettingsFileCheckpoint::new(&app_config.sync.checkpoint_path));

    let flusher = Arc::new(Flusher::new(buffer.clone(), bucket_store.clone()));
    let coordinator = Arc::new(
        SyncCoordinator::new(bucket_store.clone(), sink, checkpoints)
            .with_flush_lag(app_config.flush_lag()),
    );

    let pipeline = scheduler::spawn(
        PipelineDeps {
            flusher,
            coordinator,
            store: bucket_store,
        },
        app_config.scheduler(),
    );
    tracing::info!("pipeline running; waiting for shutdown signal");

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Received shutdown signal");
    match pipeline.shutdown().await {
        FinalFlush::Flushed(_) => {}
        FinalFlush::Failed { report, error } => {
            tracing::error!(error = %error, buckets_count = report.buckets, "buffered buckets not persisted");
        }
        FinalFlush::TimedOut { abandoned } => {
            tracing::error!(buckets_count = abandoned.buckets, "final flush timed out");
        }
    }

    Ok(())
}
