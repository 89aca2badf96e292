//! Standalone executor process: worker pool plus reaper, no HTTP surface.

use anyhow::Context;

use jobforge_infra::bootstrap;
use jobforge_infra::config::Settings;
use jobforge_infra::workers::{Reaper, WorkerPool, builtin_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init().context("failed to open the log file")?;

    let settings = Settings::from_env().context("invalid configuration")?;
    if !settings.use_persistent_stores {
        tracing::warn!("USE_PERSISTENT_STORES is off; this process only sees its own in-memory queue");
    }

    let infra = bootstrap::build(&settings)
        .await
        .context("failed to initialise store and broker")?;

    let pool = WorkerPool::new(infra.coordinator.clone(), builtin_registry())
        .spawn(settings.pool_config().with_name("worker"));
    let reaper = Reaper::new(infra.coordinator.clone(), settings.reap_interval).spawn();

    tracing::info!(
        concurrency = settings.worker_concurrency,
        executors = pool.workers().len(),
        "worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, finishing current tasks");

    let stats = pool.shutdown().await;
    reaper.shutdown().await;

    tracing::info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        retried = stats.retried,
        "worker stopped"
    );
    Ok(())
}
