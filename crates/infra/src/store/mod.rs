//! Durable job storage.
//!
//! The store is the **source of truth** for every job and the only shared
//! mutable resource of the pipeline. All state changes go through
//! [`JobStore::transition`], a compare-and-swap on the current state: two
//! concurrent transitions expecting the same `from` state linearize, one wins
//! and the other receives [`StoreError::Conflict`].
//!
//! ## Implementations
//!
//! - [`InMemoryJobStore`]: tests/dev, no IO
//! - [`PostgresJobStore`]: relational persistence via `sqlx`

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;

use jobforge_core::{DomainError, Job, JobId, JobState, JobUpdate, Lease, Payload};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Input for [`JobStore::create_job`]; id and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub payload: Payload,
    pub max_attempts: u32,
}

/// Filter for operational listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub kind: Option<String>,
    /// Only jobs whose `visibility_deadline` is strictly before this instant.
    pub deadline_before: Option<DateTime<Utc>>,
    /// Only jobs whose `updated_at` is strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn deadline_before(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_before = Some(at);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| job.state == s)
            && self.kind.as_deref().is_none_or(|k| job.kind == k)
            && self
                .deadline_before
                .is_none_or(|at| job.visibility_deadline.is_some_and(|d| d < at))
            && self.updated_before.is_none_or(|at| job.updated_at < at)
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Retrying => &mut self.retrying,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.succeeded + self.failed + self.retrying + self.cancelled
    }
}

/// Job store operation error.
///
/// ## Error Categories
///
/// - **NotFound**: unknown job id
/// - **Conflict**: the compare-and-swap lost a race (re-read and retry, or abandon)
/// - **Domain**: the write would break a record invariant or state machine edge
/// - **Unavailable**: transient infrastructure failure (retry with backoff)
/// - **Storage**: any other backend failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("conflicting update on job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Durable job store.
///
/// Implementations must:
/// - assign ids and timestamps on create (state `PENDING`)
/// - commit a transition and its side-fields atomically
/// - fail a transition with `Conflict` when the record does not match the
///   expected state (and the optional owner/version guards of the update)
/// - reject edges outside the job state machine
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `PENDING` job.
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError>;

    /// Load a job by id.
    async fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Atomically move a job from `from` to `to`, applying `update`.
    async fn transition(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        update: JobUpdate,
    ) -> Result<Job, StoreError>;

    /// Touch a job without changing its state.
    ///
    /// With a lease, the write only applies while `lease.owner` holds the job
    /// and extends `visibility_deadline` to `lease.deadline`.
    async fn refresh(
        &self,
        id: JobId,
        expected: JobState,
        lease: Option<Lease>,
    ) -> Result<Job, StoreError>;

    /// Lazily list jobs matching `filter`, oldest first.
    fn list_jobs(&self, filter: JobFilter) -> BoxStream<'_, Result<Job, StoreError>>;

    /// Count jobs per state.
    async fn stats(&self) -> Result<JobStats, StoreError>;

    /// Reachability check for the health surface.
    async fn ping(&self) -> Result<(), StoreError>;
}
