use anyhow::Context;

use jobforge_infra::bootstrap;
use jobforge_infra::config::Settings;
use jobforge_infra::workers::{Reaper, WorkerPool, builtin_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init().context("failed to open the log file")?;

    let settings = Settings::from_env().context("invalid configuration")?;
    let infra = bootstrap::build(&settings)
        .await
        .context("failed to initialise store and broker")?;

    // With in-memory infrastructure the executors must live in this process.
    let embedded = settings.embedded_workers || !settings.use_persistent_stores;
    let background = embedded.then(|| {
        let pool = WorkerPool::new(infra.coordinator.clone(), builtin_registry())
            .spawn(settings.pool_config().with_name("api-embedded"));
        let reaper = Reaper::new(infra.coordinator.clone(), settings.reap_interval).spawn();
        (pool, reaper)
    });

    let app = jobforge_api::app::build_app((&infra).into());

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, embedded_workers = embedded, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some((pool, reaper)) = background {
        pool.shutdown().await;
        reaper.shutdown().await;
    }
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
