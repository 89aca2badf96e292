//! Worker pool: independent executors running fetch-execute-report loops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use jobforge_core::{ErrorKind, JobError, Payload, TaskMessage, WorkerId};

use super::handler::{HandlerRegistry, TaskContext};
use crate::coordinator::{Claim, CoordinatorError, Dispatch, JobCoordinator, Outcome};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of executors.
    pub concurrency: usize,
    /// How long one dequeue waits before re-checking for shutdown.
    pub dequeue_timeout: Duration,
    /// Lease renewal period while a task runs.
    pub heartbeat_interval: Duration,
    /// Redelivery delay when the store cannot be reached on dequeue.
    pub release_delay: Duration,
    /// Pause after a broker error.
    pub error_backoff: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dequeue_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            release_delay: Duration::from_secs(1),
            error_backoff: Duration::from_millis(500),
            name: "worker-pool".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Messages that led to an execution.
    pub processed: u64,
    pub succeeded: u64,
    /// Executions that ended the job in `FAILED`.
    pub failed: u64,
    pub retried: u64,
    /// Deliveries dropped without execution (duplicates, unknown jobs).
    pub skipped: u64,
    /// Outcomes dropped because the executor no longer held the job.
    pub superseded: u64,
    pub current_running: usize,
}

type SharedStats = Arc<Mutex<PoolStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut PoolStats)) {
    // A poisoned lock only means another executor panicked mid-update.
    let mut guard = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard);
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: SharedStats,
    workers: Vec<WorkerId>,
}

impl WorkerPoolHandle {
    /// Stop all executors after their current task and wait for them.
    ///
    /// Returns the final statistics.
    pub async fn shutdown(self) -> PoolStats {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "executor task ended abnormally");
            }
        }
        let stats = self.stats.lock().map(|s| s.clone());
        stats.unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }
}

/// Fixed-size pool of executors sharing one coordinator and handler registry.
///
/// Executors share no mutable state besides statistics; coordination goes
/// through the store and the broker.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    coordinator: JobCoordinator,
    registry: Arc<HandlerRegistry>,
}

impl WorkerPool {
    pub fn new(coordinator: JobCoordinator, registry: HandlerRegistry) -> Self {
        Self {
            coordinator,
            registry: Arc::new(registry),
        }
    }

    /// Spawn `config.concurrency` executors on the current runtime.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = SharedStats::default();
        let concurrency = config.concurrency.max(1);

        let mut joins = Vec::with_capacity(concurrency);
        let mut workers = Vec::with_capacity(concurrency);
        for index in 0..concurrency {
            let executor = Executor {
                id: WorkerId::new(),
                index,
                coordinator: self.coordinator.clone(),
                registry: self.registry.clone(),
                config: config.clone(),
                stats: stats.clone(),
            };
            workers.push(executor.id);
            joins.push(tokio::spawn(executor.run(shutdown_rx.clone())));
        }

        info!(pool = %config.name, concurrency, "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            workers,
        }
    }
}

struct Executor {
    id: WorkerId,
    index: usize,
    coordinator: JobCoordinator,
    registry: Arc<HandlerRegistry>,
    config: WorkerPoolConfig,
    stats: SharedStats,
}

impl Executor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(pool = %self.config.name, executor = self.index, worker = %self.id, "executor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.coordinator.next_message(self.config.dequeue_timeout) => next,
            };

            match next {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(pool = %self.config.name, worker = %self.id, error = %e, "failed to dequeue");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        debug!(pool = %self.config.name, executor = self.index, "executor stopped");
    }

    async fn process(&self, message: TaskMessage) {
        let claim = match self.coordinator.on_dequeue(&message, self.id).await {
            Ok(Dispatch::Execute(claim)) => claim,
            Ok(Dispatch::Discarded(reason)) => {
                debug!(job_id = %message.job_id, ?reason, "delivery discarded");
                update_stats(&self.stats, |s| s.skipped += 1);
                return;
            }
            Err(e) => {
                warn!(job_id = %message.job_id, error = %e, "could not claim job, releasing message");
                if e.is_transient() {
                    self.coordinator.release(&message, self.config.release_delay).await;
                }
                return;
            }
        };

        update_stats(&self.stats, |s| s.current_running += 1);
        let result = self.execute(&claim).await;

        let reported = match result {
            Ok(output) => self.coordinator.on_success(&claim, output).await,
            Err(error) => self.coordinator.on_failure(&claim, error).await,
        };

        update_stats(&self.stats, |s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.processed += 1;
            match &reported {
                Ok(Outcome::Succeeded) => s.succeeded += 1,
                Ok(Outcome::Failed) => s.failed += 1,
                Ok(Outcome::Retrying { .. }) => s.retried += 1,
                Ok(Outcome::Superseded(_)) => s.superseded += 1,
                Err(_) => {}
            }
        });

        if let Err(e) = reported {
            // The lease runs out and the reaper takes the job back.
            error!(job_id = %claim.job_id(), error = %e, "failed to record outcome");
        }
    }

    /// Run the handler under the hard timeout, renewing the lease meanwhile.
    async fn execute(&self, claim: &Claim) -> Result<Payload, JobError> {
        let attempt = claim.attempt();
        let Some(handler) = self.registry.get(&claim.job.kind) else {
            warn!(job_id = %claim.job_id(), kind = %claim.job.kind, "no handler for job kind");
            return Err(JobError::new(
                ErrorKind::Permanent,
                format!("no handler for job kind: {}", claim.job.kind),
                attempt,
            ));
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = TaskContext::new(&claim.job, cancel_rx);
        let mut task = tokio::spawn(async move { handler.handle(ctx).await });

        let execution_timeout = claim.policy.execution_timeout;
        let deadline = tokio::time::sleep(execution_timeout);
        tokio::pin!(deadline);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lease_lost = false;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(failure)) => Err(failure.into_job_error(attempt)),
                        Err(e) => Err(JobError::new(
                            ErrorKind::Permanent,
                            format!("handler panicked: {e}"),
                            attempt,
                        )),
                    };
                }
                _ = &mut deadline => {
                    task.abort();
                    warn!(job_id = %claim.job_id(), timeout_ms = execution_timeout.as_millis() as u64, "execution timed out");
                    return Err(JobError::new(
                        ErrorKind::Timeout,
                        format!("execution exceeded {}ms", execution_timeout.as_millis()),
                        attempt,
                    ));
                }
                _ = heartbeat.tick(), if !lease_lost => {
                    match self.coordinator.renew_lease(claim).await {
                        Ok(lease) => debug!(job_id = %claim.job_id(), deadline = %lease.deadline, "lease renewed"),
                        Err(CoordinatorError::LeaseLost(_)) => {
                            info!(job_id = %claim.job_id(), "job no longer held, signalling cancellation");
                            lease_lost = true;
                            cancel_tx.send_replace(true);
                        }
                        Err(e) => warn!(job_id = %claim.job_id(), error = %e, "lease renewal failed"),
                    }
                }
            }
        }
    }
}
