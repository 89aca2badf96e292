//! Liveness report over the pipeline's shared infrastructure.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

/// Status of one dependency: `{"status": "ok"}` or `{"status": "error", "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            error: Some(message.into()),
        }
    }

    pub fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::error(e.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Await a ping, reporting `"timed out"` if it outlives `limit`.
    pub async fn within<E, F>(limit: Duration, ping: F) -> Self
    where
        E: std::fmt::Display,
        F: Future<Output = Result<(), E>>,
    {
        match tokio::time::timeout(limit, ping).await {
            Ok(result) => Self::from_result(result),
            Err(_) => Self::error("timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Services {
    pub app: ComponentHealth,
    pub store: ComponentHealth,
    pub broker: ComponentHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub services: Services,
}

impl HealthReport {
    pub fn new(store: ComponentHealth, broker: ComponentHealth) -> Self {
        let healthy = store.is_ok() && broker.is_ok();
        Self {
            status: if healthy { "ok" } else { "error" },
            services: Services {
                app: ComponentHealth::ok(),
                store,
                broker,
            },
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}
