//! Job coordinator: owns the authoritative job record.
//!
//! The coordinator creates jobs, enqueues their task messages and reconciles
//! what executors report back into the store. It is the only component that
//! calls [`JobStore::transition`].
//!
//! ## Delivery model
//!
//! The broker is at-least-once, so every entry point tolerates duplicates:
//! - a message for a terminal or already-running job is acked and dropped
//! - a lost claim race (`Conflict`) is acked and dropped
//! - an outcome reported by an executor that no longer holds the lease is
//!   acked and dropped (the job moved on: cancelled, reaped, ...)
//!
//! ## Recovery
//!
//! [`JobCoordinator::reap`] returns expired `RUNNING` jobs to `RETRYING`
//! (or `FAILED` once out of attempts) and re-enqueues queued jobs whose
//! message was lost (store write committed, enqueue failed).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tracing::{debug, info, instrument, warn};

use jobforge_core::{
    DomainError, ErrorKind, Job, JobError, JobId, JobPolicy, JobState, JobUpdate, Lease,
    MessageHandle, Payload, PolicyTable, TaskMessage, WorkerId, DEFAULT_KIND,
};

use crate::broker::{Broker, BrokerError};
use crate::health::{ComponentHealth, HealthReport};
use crate::retry::InfraRetry;
use crate::store::{JobFilter, JobStats, JobStore, NewJob, StoreError};

/// Coordinator error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("lease on job {0} is no longer held")]
    LeaseLost(JobId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("broker error: {0}")]
    Broker(String),
}

impl CoordinatorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinatorError::StoreUnavailable(_) | CoordinatorError::BrokerUnavailable(_)
        )
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoordinatorError::NotFound(id),
            StoreError::Conflict { .. } => CoordinatorError::Conflict(err.to_string()),
            StoreError::Domain(e) => CoordinatorError::Invalid(e),
            StoreError::Unavailable(msg) => CoordinatorError::StoreUnavailable(msg),
            StoreError::Storage(msg) => CoordinatorError::Store(msg),
        }
    }
}

impl From<BrokerError> for CoordinatorError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) => CoordinatorError::BrokerUnavailable(msg),
            other => CoordinatorError::Broker(other.to_string()),
        }
    }
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lease granted on claim and on every renewal.
    pub lease_ttl: Duration,
    /// How long a queued job may sit untouched before it is re-enqueued.
    pub orphan_grace: Duration,
    /// Max jobs handled per reaper category per sweep.
    pub reap_batch: usize,
    /// Re-reads allowed when `cancel` loses a race.
    pub cancel_retries: u32,
    /// Limit on each dependency ping in [`JobCoordinator::health`].
    pub health_timeout: Duration,
    pub infra_retry: InfraRetry,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            orphan_grace: Duration::from_secs(300),
            reap_batch: 100,
            cancel_retries: 8,
            health_timeout: Duration::from_secs(2),
            infra_retry: InfraRetry::default(),
        }
    }
}

/// Read model returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: JobId,
    pub kind: String,
    pub state: JobState,
    pub result: Option<Payload>,
    pub error: Option<JobError>,
    pub last_error: Option<JobError>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatus {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            state: job.state,
            result: job.result,
            error: job.error,
            last_error: job.last_error,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// A job claimed for execution by one executor.
#[derive(Debug, Clone)]
pub struct Claim {
    /// The record as committed by the claim (state `RUNNING`).
    pub job: Job,
    pub handle: MessageHandle,
    pub lease: Lease,
    pub policy: JobPolicy,
}

impl Claim {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt_count
    }
}

/// Why a delivered message was dropped without execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    UnknownJob,
    Terminal(JobState),
    AlreadyRunning,
    LostClaim,
    AttemptsExhausted,
}

/// Result of [`JobCoordinator::on_dequeue`].
#[derive(Debug, Clone)]
pub enum Dispatch {
    Execute(Claim),
    Discarded(DiscardReason),
}

/// Result of reporting an execution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying { delay: Duration },
    Failed,
    /// The executor no longer held the job; its report was dropped.
    Superseded(JobState),
}

/// Summary of one reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired_retried: usize,
    pub expired_failed: usize,
    pub orphans_requeued: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.expired_retried + self.expired_failed + self.orphans_requeued
    }
}

/// Job coordinator.
#[derive(Clone)]
pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    policies: Arc<PolicyTable>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("policies", &self.policies)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        policies: PolicyTable,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            broker,
            policies: Arc::new(policies),
            config,
        }
    }

    /// Submit a job of the default kind.
    pub async fn submit(&self, payload: Payload) -> Result<JobId, CoordinatorError> {
        self.submit_with_kind(DEFAULT_KIND, payload).await
    }

    /// Create a `PENDING` job and enqueue its first message.
    ///
    /// The store write commits first. If the enqueue still fails after local
    /// retries the job id is returned anyway: the reaper re-enqueues orphaned
    /// `PENDING` jobs.
    #[instrument(skip(self, payload), err)]
    pub async fn submit_with_kind(&self, kind: &str, payload: Payload) -> Result<JobId, CoordinatorError> {
        let policy = self.policies.policy_for(kind);
        let new_job = NewJob {
            kind: kind.to_string(),
            payload,
            max_attempts: policy.retry.max_attempts,
        };

        let job = self
            .config
            .infra_retry
            .run("create_job", || self.store.create_job(new_job.clone()))
            .await?;

        match self
            .config
            .infra_retry
            .run("enqueue", || self.broker.enqueue(job.id, job.attempt_count))
            .await
        {
            Ok(_) => info!(job_id = %job.id, "job submitted"),
            Err(e) => warn!(
                job_id = %job.id,
                error = %e,
                "job stored but enqueue failed; the reaper will re-enqueue it"
            ),
        }
        Ok(job.id)
    }

    /// Current state of a job, straight from the store.
    pub async fn get_status(&self, id: JobId) -> Result<JobStatus, CoordinatorError> {
        let job = self
            .config
            .infra_retry
            .run("get_job", || self.store.get_job(id))
            .await?;
        Ok(job.into())
    }

    /// List jobs for operational views.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<JobStatus>, CoordinatorError> {
        let jobs: Vec<Job> = self
            .config
            .infra_retry
            .run("list_jobs", || self.store.list_jobs(filter.clone()).try_collect())
            .await?;
        Ok(jobs.into_iter().map(JobStatus::from).collect())
    }

    pub async fn stats(&self) -> Result<JobStats, CoordinatorError> {
        Ok(self.config.infra_retry.run("stats", || self.store.stats()).await?)
    }

    /// Cancel a job from whatever non-terminal state it is in.
    ///
    /// Returns `false` when the job was already terminal. A running executor
    /// finds out through its next lease renewal.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn cancel(&self, id: JobId) -> Result<bool, CoordinatorError> {
        for _ in 0..=self.config.cancel_retries {
            let job = self
                .config
                .infra_retry
                .run("get_job", || self.store.get_job(id))
                .await?;
            if job.is_terminal() {
                return Ok(false);
            }

            match self
                .store
                .transition(id, job.state, JobState::Cancelled, JobUpdate::default())
                .await
            {
                Ok(_) => {
                    info!(job_id = %id, from = %job.state, "job cancelled");
                    return Ok(true);
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    debug!(job_id = %id, actual = %actual, "cancel lost a race, re-reading");
                }
                Err(e) if e.is_transient() => {
                    tokio::time::sleep(self.config.infra_retry.base_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoordinatorError::Conflict(format!(
            "job {id} kept changing while cancelling"
        )))
    }

    /// Wait for the next task message.
    pub async fn next_message(&self, timeout: Duration) -> Result<Option<TaskMessage>, CoordinatorError> {
        Ok(self.broker.dequeue(timeout).await?)
    }

    /// Claim the job referenced by `message` for `worker`.
    ///
    /// Every discarded delivery is acked. An `Err` means the store could not
    /// be reached; the caller should release the message.
    #[instrument(skip(self, message, worker), fields(job_id = %message.job_id, worker = %worker), err)]
    pub async fn on_dequeue(
        &self,
        message: &TaskMessage,
        worker: WorkerId,
    ) -> Result<Dispatch, CoordinatorError> {
        let handle = message.handle();
        let job = match self
            .config
            .infra_retry
            .run("get_job", || self.store.get_job(message.job_id))
            .await
        {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %message.job_id, "message references an unknown job, dropping");
                return Ok(self.discard(&handle, DiscardReason::UnknownJob).await);
            }
            Err(e) => return Err(e.into()),
        };

        match job.state {
            state if state.is_terminal() => {
                debug!(job_id = %job.id, state = %state, "duplicate delivery of a finished job");
                return Ok(self.discard(&handle, DiscardReason::Terminal(state)).await);
            }
            JobState::Running => {
                debug!(job_id = %job.id, "job already running elsewhere");
                return Ok(self.discard(&handle, DiscardReason::AlreadyRunning).await);
            }
            JobState::Retrying if !job.has_attempts_left() => {
                let error = job.last_error.clone().unwrap_or_else(|| {
                    JobError::new(ErrorKind::Abandoned, "retry budget exhausted", job.attempt_count)
                });
                match self
                    .store
                    .transition(
                        job.id,
                        JobState::Retrying,
                        JobState::Failed,
                        JobUpdate::fail(error).at_version(job.version),
                    )
                    .await
                {
                    Ok(_) => info!(job_id = %job.id, attempts = job.attempt_count, "job failed: attempts exhausted"),
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e.into()),
                }
                return Ok(self.discard(&handle, DiscardReason::AttemptsExhausted).await);
            }
            _ => {}
        }

        let policy = self.policies.policy_for(&job.kind).clone();
        let lease = Lease {
            owner: worker,
            deadline: Utc::now() + to_chrono(self.config.lease_ttl),
        };

        match self
            .store
            .transition(job.id, job.state, JobState::Running, JobUpdate::claim(lease))
            .await
        {
            Ok(job) => {
                info!(job_id = %job.id, kind = %job.kind, attempt = job.attempt_count, "job claimed");
                Ok(Dispatch::Execute(Claim {
                    job,
                    handle,
                    lease,
                    policy,
                }))
            }
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(job_id = %job.id, actual = %actual, "lost claim race");
                Ok(self.discard(&handle, DiscardReason::LostClaim).await)
            }
            Err(StoreError::Domain(e)) => {
                warn!(job_id = %job.id, error = %e, "claim rejected");
                Ok(self.discard(&handle, DiscardReason::LostClaim).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Extend the lease of a running claim.
    ///
    /// `LeaseLost` means the job is no longer held by this executor
    /// (cancelled, reaped or finished elsewhere).
    pub async fn renew_lease(&self, claim: &Claim) -> Result<Lease, CoordinatorError> {
        let lease = Lease {
            owner: claim.lease.owner,
            deadline: Utc::now() + to_chrono(self.config.lease_ttl),
        };
        match self
            .store
            .refresh(claim.job_id(), JobState::Running, Some(lease))
            .await
        {
            Ok(_) => Ok(lease),
            Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {
                Err(CoordinatorError::LeaseLost(claim.job_id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a successful execution and ack the message.
    #[instrument(skip(self, claim, result), fields(job_id = %claim.job_id()), err)]
    pub async fn on_success(&self, claim: &Claim, result: Payload) -> Result<Outcome, CoordinatorError> {
        let update = JobUpdate::succeed(result).held_by(claim.lease.owner);
        match self
            .config
            .infra_retry
            .run("transition", || {
                self.store
                    .transition(claim.job_id(), JobState::Running, JobState::Succeeded, update.clone())
            })
            .await
        {
            Ok(_) => {
                info!(job_id = %claim.job_id(), attempt = claim.attempt(), "job succeeded");
                self.ack(&claim.handle).await;
                Ok(Outcome::Succeeded)
            }
            Err(StoreError::Conflict { .. }) => self.superseded(claim).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Record a failed execution: retry with backoff while attempts remain
    /// and the error is retryable, otherwise fail the job.
    #[instrument(skip(self, claim, error), fields(job_id = %claim.job_id(), kind = ?error.kind), err)]
    pub async fn on_failure(&self, claim: &Claim, error: JobError) -> Result<Outcome, CoordinatorError> {
        let attempt = claim.attempt();
        let retry = error.kind.is_retryable() && claim.job.has_attempts_left();

        if retry {
            let update = JobUpdate::retry(error.clone()).held_by(claim.lease.owner);
            match self
                .config
                .infra_retry
                .run("transition", || {
                    self.store
                        .transition(claim.job_id(), JobState::Running, JobState::Retrying, update.clone())
                })
                .await
            {
                Ok(_) => {
                    let delay = claim.policy.retry.delay_for_attempt(attempt);
                    info!(
                        job_id = %claim.job_id(),
                        attempt,
                        error = %error.message,
                        retry_in_ms = delay.as_millis() as u64,
                        "job attempt failed, retrying"
                    );
                    if let Err(e) = self
                        .config
                        .infra_retry
                        .run("nack", || self.broker.nack(&claim.handle, delay))
                        .await
                    {
                        warn!(job_id = %claim.job_id(), error = %e, "nack failed; the reaper will re-enqueue the job");
                    }
                    Ok(Outcome::Retrying { delay })
                }
                Err(StoreError::Conflict { .. }) => self.superseded(claim).await,
                Err(e) => Err(e.into()),
            }
        } else {
            let update = JobUpdate::fail(error.clone()).held_by(claim.lease.owner);
            match self
                .config
                .infra_retry
                .run("transition", || {
                    self.store
                        .transition(claim.job_id(), JobState::Running, JobState::Failed, update.clone())
                })
                .await
            {
                Ok(_) => {
                    warn!(job_id = %claim.job_id(), attempt, error = %error.message, "job failed");
                    self.ack(&claim.handle).await;
                    Ok(Outcome::Failed)
                }
                Err(StoreError::Conflict { .. }) => self.superseded(claim).await,
                Err(e) => Err(e.into()),
            }
        }
    }

    /// Sweep expired leases and orphaned queued jobs.
    #[instrument(skip(self), err)]
    pub async fn reap(&self) -> Result<ReapReport, CoordinatorError> {
        let mut report = ReapReport::default();
        let now = Utc::now();

        let expired = self
            .list_raw(JobFilter::state(JobState::Running).deadline_before(now).limit(self.config.reap_batch))
            .await?;
        for job in expired.into_iter().filter(|job| job.lease_expired(now)) {
            let abandoned = JobError::new(
                ErrorKind::Abandoned,
                "lease expired before the executor reported",
                job.attempt_count,
            );
            let (to, update) = if job.has_attempts_left() {
                (JobState::Retrying, JobUpdate::retry(abandoned))
            } else {
                (JobState::Failed, JobUpdate::fail(abandoned))
            };

            match self
                .store
                .transition(job.id, JobState::Running, to, update.at_version(job.version))
                .await
            {
                Ok(reaped) if to == JobState::Retrying => {
                    warn!(job_id = %job.id, owner = ?job.lease_owner, "lease expired, job re-enqueued");
                    self.requeue(&reaped).await;
                    report.expired_retried += 1;
                }
                Ok(_) => {
                    warn!(job_id = %job.id, owner = ?job.lease_owner, "lease expired, no attempts left");
                    report.expired_failed += 1;
                }
                Err(e) if e.is_conflict() => debug!(job_id = %job.id, "job moved on before reaping"),
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to reap expired job"),
            }
        }

        let cutoff = now - to_chrono(self.config.orphan_grace);
        for state in [JobState::Pending, JobState::Retrying] {
            let stale = self
                .list_raw(JobFilter::state(state).updated_before(cutoff).limit(self.config.reap_batch))
                .await?;
            for job in stale {
                if state == JobState::Retrying && self.in_backoff(&job, cutoff) {
                    continue;
                }
                match self.store.refresh(job.id, state, None).await {
                    Ok(touched) => {
                        info!(job_id = %job.id, state = %state, "re-enqueuing orphaned job");
                        self.requeue(&touched).await;
                        report.orphans_requeued += 1;
                    }
                    Err(e) if e.is_conflict() => {}
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => warn!(job_id = %job.id, error = %e, "failed to touch orphaned job"),
                }
            }
        }

        if report.total() > 0 {
            info!(
                expired_retried = report.expired_retried,
                expired_failed = report.expired_failed,
                orphans_requeued = report.orphans_requeued,
                "reaper sweep finished"
            );
        }
        Ok(report)
    }

    /// Store and broker reachability. Each ping is bounded by `health_timeout`.
    pub async fn health(&self) -> HealthReport {
        let limit = self.config.health_timeout;
        let (store, broker) = tokio::join!(
            ComponentHealth::within(limit, self.store.ping()),
            ComponentHealth::within(limit, self.broker.ping()),
        );
        HealthReport::new(store, broker)
    }

    /// Release a message without touching the job (store unreachable).
    pub async fn release(&self, message: &TaskMessage, delay: Duration) {
        if let Err(e) = self.broker.nack(&message.handle(), delay).await {
            warn!(job_id = %message.job_id, error = %e, "failed to release message; it will be redelivered");
        }
    }

    /// A RETRYING job may still have a delayed message waiting out its
    /// backoff; it only counts as orphaned once the longest delay has passed.
    fn in_backoff(&self, job: &Job, cutoff: DateTime<Utc>) -> bool {
        let max_delay = self.policies.policy_for(&job.kind).retry.max_delay;
        job.updated_at >= cutoff - to_chrono(max_delay)
    }

    async fn list_raw(&self, filter: JobFilter) -> Result<Vec<Job>, CoordinatorError> {
        Ok(self
            .config
            .infra_retry
            .run("list_jobs", || self.store.list_jobs(filter.clone()).try_collect())
            .await?)
    }

    async fn requeue(&self, job: &Job) {
        if let Err(e) = self
            .config
            .infra_retry
            .run("enqueue", || self.broker.enqueue(job.id, job.attempt_count))
            .await
        {
            warn!(job_id = %job.id, error = %e, "re-enqueue failed; next sweep will retry");
        }
    }

    async fn superseded(&self, claim: &Claim) -> Result<Outcome, CoordinatorError> {
        let current = self
            .config
            .infra_retry
            .run("get_job", || self.store.get_job(claim.job_id()))
            .await?;
        info!(
            job_id = %claim.job_id(),
            state = %current.state,
            "executor no longer holds the job, dropping its outcome"
        );
        self.ack(&claim.handle).await;
        Ok(Outcome::Superseded(current.state))
    }

    async fn discard(&self, handle: &MessageHandle, reason: DiscardReason) -> Dispatch {
        self.ack(handle).await;
        Dispatch::Discarded(reason)
    }

    /// Ack failures only cause a duplicate delivery, which is tolerated.
    async fn ack(&self, handle: &MessageHandle) {
        if let Err(e) = self
            .config
            .infra_retry
            .run("ack", || self.broker.ack(handle))
            .await
        {
            warn!(job_id = %handle.job_id, error = %e, "ack failed; message may be redelivered");
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
