//! Process configuration from environment variables.
//!
//! `Settings::from_env()` also loads a `.env` file when present. Every key is
//! optional except `DATABASE_URL` when `USE_PERSISTENT_STORES=true`.
//!
//! | variable | default |
//! |----------|---------|
//! | `DATABASE_URL` | - |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `HOST` / `PORT` | `0.0.0.0` / `8080` |
//! | `WORKER_CONCURRENCY` | `4` |
//! | `EMBEDDED_WORKERS` | `true` |
//! | `DEQUEUE_TIMEOUT_MS` | `1000` |
//! | `EXECUTION_TIMEOUT_SECS` | `300` |
//! | `LEASE_TTL_SECS` | `30` |
//! | `REAP_INTERVAL_SECS` | `10` |
//! | `ORPHAN_GRACE_SECS` | `300` |
//! | `HEALTH_TIMEOUT_MS` | `2000` |
//! | `MAX_ATTEMPTS` | `3` |
//! | `RETRY_BASE_DELAY_MS` / `RETRY_MAX_DELAY_MS` | `500` / `60000` |
//! | `REDIS_STREAM_KEY` / `REDIS_GROUP` | `jobforge:tasks` / `jobforge.workers` |
//!
//! `RETRY_MAX_DELAY_MS` must stay below `ORPHAN_GRACE_SECS`, otherwise the
//! reaper would treat jobs waiting out their backoff as orphans.

use std::str::FromStr;
use std::time::Duration;

use jobforge_core::{JobPolicy, PolicyTable, RetryPolicy};

use crate::coordinator::CoordinatorConfig;
use crate::workers::WorkerPoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub redis_url: String,
    pub use_persistent_stores: bool,
    pub host: String,
    pub port: u16,
    pub worker_concurrency: usize,
    pub embedded_workers: bool,
    pub dequeue_timeout: Duration,
    pub execution_timeout: Duration,
    pub lease_ttl: Duration,
    pub reap_interval: Duration,
    pub orphan_grace: Duration,
    pub health_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub redis_stream_key: Option<String>,
    pub redis_group: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            use_persistent_stores: false,
            host: "0.0.0.0".to_string(),
            port: 8080,
            worker_concurrency: 4,
            embedded_workers: true,
            dequeue_timeout: Duration::from_millis(1000),
            execution_timeout: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
            orphan_grace: Duration::from_secs(300),
            health_timeout: Duration::from_millis(2000),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(60),
            redis_stream_key: None,
            redis_group: None,
        }
    }
}

impl Settings {
    /// Read settings from the process environment (and `.env`, if any).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let settings = Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            use_persistent_stores: parse_or(&get, "USE_PERSISTENT_STORES", defaults.use_persistent_stores, parse_bool)?,
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port, parse_num)?,
            worker_concurrency: parse_or(&get, "WORKER_CONCURRENCY", defaults.worker_concurrency, parse_num)?,
            embedded_workers: parse_or(&get, "EMBEDDED_WORKERS", defaults.embedded_workers, parse_bool)?,
            dequeue_timeout: parse_or(&get, "DEQUEUE_TIMEOUT_MS", defaults.dequeue_timeout, parse_millis)?,
            execution_timeout: parse_or(&get, "EXECUTION_TIMEOUT_SECS", defaults.execution_timeout, parse_secs)?,
            lease_ttl: parse_or(&get, "LEASE_TTL_SECS", defaults.lease_ttl, parse_secs)?,
            reap_interval: parse_or(&get, "REAP_INTERVAL_SECS", defaults.reap_interval, parse_secs)?,
            orphan_grace: parse_or(&get, "ORPHAN_GRACE_SECS", defaults.orphan_grace, parse_secs)?,
            health_timeout: parse_or(&get, "HEALTH_TIMEOUT_MS", defaults.health_timeout, parse_millis)?,
            max_attempts: parse_or(&get, "MAX_ATTEMPTS", defaults.max_attempts, parse_num)?,
            retry_base_delay: parse_or(&get, "RETRY_BASE_DELAY_MS", defaults.retry_base_delay, parse_millis)?,
            retry_max_delay: parse_or(&get, "RETRY_MAX_DELAY_MS", defaults.retry_max_delay, parse_millis)?,
            redis_stream_key: get("REDIS_STREAM_KEY"),
            redis_group: get("REDIS_GROUP"),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_persistent_stores && self.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.worker_concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.lease_ttl.is_zero() {
            return Err(invalid("LEASE_TTL_SECS", "0", "must be positive"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(invalid(
                "RETRY_BASE_DELAY_MS",
                &self.retry_base_delay.as_millis().to_string(),
                "must not exceed RETRY_MAX_DELAY_MS",
            ));
        }
        if self.retry_max_delay >= self.orphan_grace {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS",
                &self.retry_max_delay.as_millis().to_string(),
                "must be below ORPHAN_GRACE_SECS",
            ));
        }
        if self.health_timeout.is_zero() {
            return Err(invalid("HEALTH_TIMEOUT_MS", "0", "must be positive"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default policy from settings; specific kinds can be added on top.
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable::new(JobPolicy {
            retry: RetryPolicy::exponential(self.max_attempts, self.retry_base_delay, self.retry_max_delay),
            execution_timeout: self.execution_timeout,
        })
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            lease_ttl: self.lease_ttl,
            orphan_grace: self.orphan_grace,
            health_timeout: self.health_timeout,
            ..Default::default()
        }
    }

    /// Pool config; the lease is renewed three times per TTL.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.worker_concurrency,
            dequeue_timeout: self.dequeue_timeout,
            heartbeat_interval: self.lease_ttl / 3,
            ..Default::default()
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => parse(raw.trim()).map_err(|reason| invalid(key, &raw, reason)),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected true or false".to_string()),
    }
}

fn parse_num<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| e.to_string())
}

fn parse_millis(raw: &str) -> Result<Duration, String> {
    parse_num::<u64>(raw).map(Duration::from_millis)
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
    parse_num::<u64>(raw).map(Duration::from_secs)
}
