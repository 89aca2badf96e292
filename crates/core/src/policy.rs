//! Retry and execution policies, looked up per job kind.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Redelivery delay after the given attempt failed: `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

}

/// Everything the pipeline needs to know about one job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    pub retry: RetryPolicy,
    /// Hard limit on a single execution.
    pub execution_timeout: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            execution_timeout: Duration::from_secs(300),
        }
    }
}

/// Per-kind policy table with a fallback entry.
///
/// Lookup order: exact kind, then the longest matching `prefix.*` pattern,
/// then the default policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    default: JobPolicy,
    by_kind: HashMap<String, JobPolicy>,
}

impl PolicyTable {
    pub fn new(default: JobPolicy) -> Self {
        Self {
            default,
            by_kind: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, pattern: impl Into<String>, policy: JobPolicy) -> Self {
        self.by_kind.insert(pattern.into(), policy);
        self
    }

    pub fn default_policy(&self) -> &JobPolicy {
        &self.default
    }

    pub fn policy_for(&self, kind: &str) -> &JobPolicy {
        if let Some(policy) = self.by_kind.get(kind) {
            return policy;
        }

        self.by_kind
            .iter()
            .filter_map(|(pattern, policy)| Some((category_match(pattern, kind)?, policy)))
            .max_by_key(|(len, _)| *len)
            .map(|(_, policy)| policy)
            .unwrap_or(&self.default)
    }
}

/// Match `kind` against a `prefix.*` category pattern.
///
/// The prefix must end on a segment boundary: `media.*` covers `media.resize`
/// and `media.video.hd`, but neither `media` nor `mediaserver`. Returns the
/// prefix length so callers can prefer the most specific pattern.
pub fn category_match(pattern: &str, kind: &str) -> Option<usize> {
    let prefix = pattern.strip_suffix(".*")?;
    kind.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('.'))
        .then_some(prefix.len())
}
