//! Wiring of store, broker and coordinator from [`Settings`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::broker::{Broker, InMemoryBroker};
use crate::config::Settings;
use crate::coordinator::JobCoordinator;
use crate::store::{InMemoryJobStore, JobStore};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("persistent stores requested but {0}")]
    Unsupported(&'static str),

    #[error("store: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("broker: {0}")]
    Broker(#[from] crate::broker::BrokerError),
}

/// The shared pipeline components of one process.
#[derive(Clone)]
pub struct Infrastructure {
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    pub coordinator: JobCoordinator,
}

impl std::fmt::Debug for Infrastructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Infrastructure")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl Infrastructure {
    fn assemble(settings: &Settings, store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        let coordinator = JobCoordinator::new(
            store.clone(),
            broker.clone(),
            settings.policy_table(),
            settings.coordinator_config(),
        );
        Self {
            store,
            broker,
            coordinator,
        }
    }
}

/// Build infrastructure according to `USE_PERSISTENT_STORES`.
pub async fn build(settings: &Settings) -> Result<Infrastructure, BootstrapError> {
    if settings.use_persistent_stores {
        build_persistent(settings).await
    } else {
        Ok(build_in_memory(settings))
    }
}

/// Process-local store and broker. Nothing survives a restart.
pub fn build_in_memory(settings: &Settings) -> Infrastructure {
    info!("using in-memory store and broker");
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::with_visibility_timeout(visibility_timeout(settings)));
    Infrastructure::assemble(settings, store, broker)
}

#[cfg(feature = "redis")]
async fn build_persistent(settings: &Settings) -> Result<Infrastructure, BootstrapError> {
    use crate::broker::RedisStreamsBroker;
    use crate::store::PostgresJobStore;

    let database_url = settings
        .database_url
        .as_deref()
        .ok_or(BootstrapError::Unsupported("DATABASE_URL is not set"))?;

    info!("connecting to Postgres");
    let store = PostgresJobStore::connect(database_url).await?;
    store.migrate().await?;

    info!(redis_url = %settings.redis_url, "connecting to Redis");
    let broker = RedisStreamsBroker::connect(
        &settings.redis_url,
        settings.redis_stream_key.clone(),
        settings.redis_group.clone(),
        visibility_timeout(settings),
    )
    .await?;

    Ok(Infrastructure::assemble(settings, Arc::new(store), Arc::new(broker)))
}

#[cfg(not(feature = "redis"))]
async fn build_persistent(_settings: &Settings) -> Result<Infrastructure, BootstrapError> {
    Err(BootstrapError::Unsupported("the `redis` feature is disabled"))
}

/// A delivery stays invisible for a full execution plus one lease.
fn visibility_timeout(settings: &Settings) -> Duration {
    settings.execution_timeout + settings.lease_ttl
}
