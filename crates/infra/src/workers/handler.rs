//! Task handlers and the registry that routes job kinds to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use jobforge_core::{ErrorKind, Job, JobError, JobId, Payload, category_match};

/// Everything a handler gets to see about the job it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    job_id: JobId,
    kind: String,
    attempt: u32,
    payload: Payload,
    cancel: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(job: &Job, cancel: watch::Receiver<bool>) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempt_count,
            payload: job.payload.clone(),
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether the job was cancelled (or lost) while running.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), TaskFailure> {
        if self.is_cancelled() {
            Err(TaskFailure::cancelled())
        } else {
            Ok(())
        }
    }

    /// Resolves once the job is cancelled. Never resolves otherwise.
    pub async fn cancelled(&mut self) {
        if self.cancel.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    /// May succeed on another attempt.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Never retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::permanent("cancelled")
    }

    pub fn into_job_error(self, attempt: u32) -> JobError {
        JobError::new(self.kind, self.message, attempt)
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Business logic for one or more job kinds.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> Result<Payload, TaskFailure>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, TaskFailure>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> Result<Payload, TaskFailure> {
        (self.0)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, TaskFailure>> + Send + 'static,
{
    FnHandler(f)
}

/// Handlers keyed by kind pattern.
///
/// Lookup order: exact kind, then the longest matching `prefix.*`
/// (e.g. `media.*` matches `media.transcode`), then `*`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, TaskFailure>> + Send + 'static,
    {
        self.register(pattern, handler_fn(f))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        if let Some(h) = self.handlers.get(kind) {
            return Some(h.clone());
        }

        let by_prefix = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| Some((category_match(pattern, kind)?, handler)))
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone());

        by_prefix.or_else(|| self.handlers.get("*").cloned())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.patterns().collect();
        patterns.sort_unstable();
        f.debug_struct("HandlerRegistry").field("patterns", &patterns).finish()
    }
}
