//! The durable job record and its side-fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, WorkerId};
use crate::payload::Payload;
use crate::state::JobState;

/// Default job kind when the submitter does not name one.
pub const DEFAULT_KIND: &str = "default";

/// Classification of a failed attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Business logic failed but may succeed on another attempt.
    Transient,
    /// Execution exceeded its hard timeout.
    Timeout,
    /// Business logic signalled a non-retryable error.
    Permanent,
    /// The executor holding the lease disappeared.
    Abandoned,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// Structured failure descriptor stored on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Attempt number (1-based) that produced this error.
    pub attempt: u32,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
        }
    }
}

/// In-flight lease held by an executor while the job is `RUNNING`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub deadline: DateTime<Utc>,
}

/// Side-fields committed atomically together with a state transition.
///
/// `if_owner` and `if_version` narrow the compare-and-swap beyond the expected
/// state: the store rejects the write with a conflict when the lease has
/// changed hands or the record was written since it was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub result: Option<Payload>,
    pub error: Option<JobError>,
    pub last_error: Option<JobError>,
    pub increment_attempt: bool,
    pub lease: Option<Lease>,
    pub if_owner: Option<WorkerId>,
    pub if_version: Option<u64>,
}

impl JobUpdate {
    /// Claim for execution: bump the attempt counter and take the lease.
    pub fn claim(lease: Lease) -> Self {
        Self {
            increment_attempt: true,
            lease: Some(lease),
            ..Default::default()
        }
    }

    pub fn succeed(result: Payload) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn fail(error: JobError) -> Self {
        Self {
            last_error: Some(error.clone()),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn retry(error: JobError) -> Self {
        Self {
            last_error: Some(error),
            ..Default::default()
        }
    }

    /// Only apply while `owner` still holds the lease.
    pub fn held_by(mut self, owner: WorkerId) -> Self {
        self.if_owner = Some(owner);
        self
    }

    /// Only apply if the record is still at `version`.
    pub fn at_version(mut self, version: u64) -> Self {
        self.if_version = Some(version);
        self
    }

    /// Check that the side-fields are allowed for a transition into `to`.
    pub fn validate_for(&self, to: JobState) -> DomainResult<()> {
        if self.result.is_some() && to != JobState::Succeeded {
            return Err(DomainError::invariant(format!(
                "result may only be set when entering SUCCEEDED, not {to}"
            )));
        }
        if self.error.is_some() && to != JobState::Failed {
            return Err(DomainError::invariant(format!(
                "error may only be set when entering FAILED, not {to}"
            )));
        }
        if (self.lease.is_some() || self.increment_attempt) && to != JobState::Running {
            return Err(DomainError::invariant(format!(
                "lease/attempt may only change when entering RUNNING, not {to}"
            )));
        }
        if to == JobState::Running && (self.lease.is_none() || !self.increment_attempt) {
            return Err(DomainError::invariant(
                "entering RUNNING requires a lease and an attempt increment",
            ));
        }
        Ok(())
    }
}

/// A durable record of one unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub state: JobState,
    pub payload: Payload,
    pub result: Option<Payload>,
    pub error: Option<JobError>,
    pub last_error: Option<JobError>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub visibility_deadline: Option<DateTime<Utc>>,
    pub lease_owner: Option<WorkerId>,
    /// Bumped on every write; used for compare-and-swap.
    pub version: u64,
}

impl Job {
    /// Create a new `PENDING` job.
    pub fn new(
        kind: impl Into<String>,
        payload: Payload,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(DomainError::validation("job kind must not be empty"));
        }
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        Ok(Self {
            id: JobId::new(),
            kind,
            state: JobState::Pending,
            payload,
            result: None,
            error: None,
            last_error: None,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            visibility_deadline: None,
            lease_owner: None,
            version: 1,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Whether the in-flight lease is past its deadline. A lease is still
    /// valid at the exact deadline instant.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running
            && self.visibility_deadline.is_none_or(|deadline| deadline < now)
    }

    /// Whether the record satisfies the compare-and-swap expectation of a write.
    pub fn matches(&self, expected: JobState, update: &JobUpdate) -> bool {
        self.state == expected
            && update.if_owner.is_none_or(|owner| self.lease_owner == Some(owner))
            && update.if_version.is_none_or(|version| self.version == version)
    }

    /// Extend the lease (or just touch the record) without changing state.
    pub fn touch(&mut self, lease_deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        if let Some(deadline) = lease_deadline {
            self.visibility_deadline = Some(deadline);
        }
        self.updated_at = now;
        self.version += 1;
    }

    /// Apply a transition and its side-fields, enforcing every record invariant.
    ///
    /// The caller is responsible for the compare-and-swap on the current state;
    /// this only validates the edge and the fields.
    pub fn apply(&mut self, to: JobState, update: JobUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        self.state.ensure_transition(to)?;
        update.validate_for(to)?;

        if update.increment_attempt && self.attempt_count >= self.max_attempts {
            return Err(DomainError::invariant(format!(
                "attempt_count {} already reached max_attempts {}",
                self.attempt_count, self.max_attempts
            )));
        }
        if update.result.is_some() && self.result.is_some() {
            return Err(DomainError::invariant("result already set"));
        }
        if update.error.is_some() && self.error.is_some() {
            return Err(DomainError::invariant("error already set"));
        }

        if update.increment_attempt {
            self.attempt_count += 1;
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(last_error) = update.last_error {
            self.last_error = Some(last_error);
        }
        match update.lease {
            Some(lease) => {
                self.lease_owner = Some(lease.owner);
                self.visibility_deadline = Some(lease.deadline);
            }
            None => {
                self.lease_owner = None;
                self.visibility_deadline = None;
            }
        }

        self.state = to;
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }
}
