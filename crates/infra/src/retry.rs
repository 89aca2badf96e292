//! Local retry of transient infrastructure errors.
//!
//! Store/broker outages are retried here with a short bounded backoff and
//! never turned into job failures. Anything non-transient is returned at once.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::broker::BrokerError;
use crate::store::StoreError;

/// Errors that may go away on their own.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

/// Bounded exponential backoff for infrastructure calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfraRetry {
    /// Total tries, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for InfraRetry {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl InfraRetry {
    /// Fail fast; used by tests that exercise outages.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    fn delay_for(&self, try_index: u32) -> Duration {
        let factor = 2u32.checked_pow(try_index).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op`, retrying while it fails transiently.
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let mut try_index = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && try_index + 1 < self.attempts.max(1) => {
                    let delay = self.delay_for(try_index);
                    warn!(operation, error = %e, retry_in_ms = delay.as_millis() as u64, "transient infrastructure error, retrying");
                    tokio::time::sleep(delay).await;
                    try_index += 1;
                }
                other => return other,
            }
        }
    }
}
