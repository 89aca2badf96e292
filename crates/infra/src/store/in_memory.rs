//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};

use jobforge_core::{Job, JobId, JobState, JobUpdate, Lease};

use super::{JobFilter, JobStats, JobStore, NewJob, StoreError};

/// In-memory job store.
///
/// - No IO
/// - Transitions are linearized by a single write lock
/// - Can be switched "offline" to exercise transient-failure paths
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails with `Unavailable` while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Overwrite a record as-is. Test hook for crafting states (e.g. a
    /// RETRYING job with no attempts left) that no delivery order produces.
    pub fn put(&self, job: Job) -> Result<(), StoreError> {
        self.write()?.insert(job.id, job);
        Ok(())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.check_available()?;
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.check_available()?;
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }

    fn snapshot(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();

        // Ids are UUIDv7, so this is creation order with a stable tie-break.
        result.sort_by_key(|j| (j.created_at, j.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let job = Job::new(new_job.kind, new_job.payload, new_job.max_attempts, Utc::now())?;
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Storage(format!("job id collision: {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.read()?.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !job.matches(from, &update) {
            return Err(StoreError::Conflict {
                id,
                expected: from,
                actual: job.state,
            });
        }

        // Apply on a copy so a rejected update leaves the record untouched.
        let mut next = job.clone();
        next.apply(to, update, Utc::now())?;
        *job = next.clone();
        Ok(next)
    }

    async fn refresh(
        &self,
        id: JobId,
        expected: JobState,
        lease: Option<Lease>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let owner_matches = lease.is_none_or(|l| job.lease_owner == Some(l.owner));
        if job.state != expected || !owner_matches {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: job.state,
            });
        }

        job.touch(lease.map(|l| l.deadline), Utc::now());
        Ok(job.clone())
    }

    fn list_jobs(&self, filter: JobFilter) -> BoxStream<'_, Result<Job, StoreError>> {
        match self.snapshot(&filter) {
            Ok(jobs) => stream::iter(jobs.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
