//! At-least-once task message transport.
//!
//! The broker only moves [`TaskMessage`]s (job references); the job record
//! itself lives in the store. A message handed out by [`Broker::dequeue`]
//! stays in flight until it is acknowledged. If nobody acks it within the
//! visibility window it is delivered again, so consumers must tolerate
//! duplicates.
//!
//! ## Implementations
//!
//! - [`InMemoryBroker`]: tests/dev, single process
//! - `RedisStreamsBroker` (feature `redis`): Redis Streams consumer group

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::time::Duration;

use async_trait::async_trait;

use jobforge_core::{JobId, MessageHandle, TaskMessage};

pub use in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Transport unreachable; retry with backoff.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Message transport between job producers and executors.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message referencing `job_id`.
    async fn enqueue(&self, job_id: JobId, attempt: u32) -> Result<MessageHandle, BrokerError>;

    /// Wait up to `timeout` for the next deliverable message.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskMessage>, BrokerError>;

    /// Mark a delivery as done. Acking an unknown or already-acked handle is a no-op.
    async fn ack(&self, handle: &MessageHandle) -> Result<(), BrokerError>;

    /// Release a delivery and schedule the message again after `delay`.
    ///
    /// When the handle is no longer in flight (e.g. it was redelivered and
    /// acked elsewhere) a fresh message for the same job is scheduled.
    async fn nack(&self, handle: &MessageHandle, delay: Duration) -> Result<(), BrokerError>;

    /// Reachability check for the health surface.
    async fn ping(&self) -> Result<(), BrokerError>;
}
