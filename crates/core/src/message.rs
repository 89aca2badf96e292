//! Broker message contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Opaque delivery token assigned by the broker.
///
/// The coordinator never inspects it; it only hands it back on ack/nack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryToken(String);

impl DeliveryToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn unassigned() -> Self {
        Self(String::new())
    }
}

impl core::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned by `enqueue`; identifies the message inside the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub job_id: JobId,
    pub token: DeliveryToken,
}

/// Broker-transported reference to a job.
///
/// Wire form is `{job_id, attempt, enqueued_at}`; the delivery token travels
/// out of band and is skipped by serde.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: JobId,
    /// Job `attempt_count` at send time.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip, default = "DeliveryToken::unassigned")]
    pub token: DeliveryToken,
}

impl TaskMessage {
    pub fn new(job_id: JobId, attempt: u32, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            attempt,
            enqueued_at,
            token: DeliveryToken::unassigned(),
        }
    }

    pub fn with_token(mut self, token: DeliveryToken) -> Self {
        self.token = token;
        self
    }

    pub fn handle(&self) -> MessageHandle {
        MessageHandle {
            job_id: self.job_id,
            token: self.token.clone(),
        }
    }
}
