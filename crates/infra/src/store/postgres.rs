//! Postgres-backed job store.
//!
//! One row per job in the `jobs` table (see `migrations/0001_jobs.sql`).
//! Record invariants are enforced twice: by [`Job::apply`] before every write
//! and by `CHECK` constraints at the database level.
//!
//! ## Compare-and-swap
//!
//! `transition()` runs in a transaction:
//! 1. `SELECT ... FOR UPDATE` the row (serializes concurrent writers)
//! 2. Check the expected state and the owner/version guards
//! 3. Apply the edge in memory, then `UPDATE ... RETURNING`
//! 4. Commit
//!
//! The loser of a race blocks on the row lock, then sees the new state and
//! receives `Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Io / Tls / PoolTimedOut / PoolClosed | `Unavailable` |
//! | Database `23505` (unique) | `Storage` (id collision) |
//! | Database `23514` (check) | `Storage` (invariant rejected by schema) |
//! | anything else | `Storage` |

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use jobforge_core::{Job, JobError, JobId, JobState, JobUpdate, Lease, Payload, WorkerId};

use super::{JobFilter, JobStats, JobStore, NewJob, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

static LIST_JOBS_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE ($1::text IS NULL OR state = $1)
            AND ($2::text IS NULL OR kind = $2)
            AND ($3::timestamptz IS NULL OR visibility_deadline < $3)
            AND ($4::timestamptz IS NULL OR updated_at < $4)
        ORDER BY created_at ASC, id ASC
        LIMIT $5
        "#
    )
});

const JOB_COLUMNS: &str = r#"
    id, kind, state, payload_schema, payload, result_schema, result,
    error, last_error, attempt_count, max_attempts, visibility_deadline,
    lease_owner, version, created_at, updated_at
"#;

/// Postgres-backed job store.
///
/// `Send + Sync`; all access goes through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            UPDATE jobs SET
                state = $2,
                result_schema = $3,
                result = $4,
                error = $5,
                last_error = $6,
                attempt_count = $7,
                visibility_deadline = $8,
                lease_owner = $9,
                version = $10,
                updated_at = $11
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.state.as_str())
            .bind(job.result.as_ref().map(|p| p.schema()))
            .bind(job.result.as_ref().map(|p| p.bytes()))
            .bind(job.error.as_ref().map(Json))
            .bind(job.last_error.as_ref().map(Json))
            .bind(job.attempt_count as i32)
            .bind(job.visibility_deadline)
            .bind(job.lease_owner.map(|o| *o.as_uuid()))
            .bind(job.version as i64)
            .bind(job.updated_at)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("write_job", e))?;

        job_from_row(&row)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new_job), fields(kind = %new_job.kind), err)]
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let job = Job::new(new_job.kind, new_job.payload, new_job.max_attempts, Utc::now())?;

        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, kind, state, payload_schema, payload, attempt_count,
                max_attempts, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.kind)
            .bind(job.state.as_str())
            .bind(job.payload.schema())
            .bind(job.payload.bytes())
            .bind(job.attempt_count as i32)
            .bind(job.max_attempts as i32)
            .bind(job.version as i64)
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Storage(format!("job id collision: {}", job.id))
                } else {
                    map_sqlx_error("create_job", e)
                }
            })?;

        job_from_row(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self, update), fields(job_id = %id, from = %from, to = %to), err)]
    async fn transition(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let Some(mut job) = Self::lock_job(&mut tx, id).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(id));
        };

        if !job.matches(from, &update) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Conflict {
                id,
                expected: from,
                actual: job.state,
            });
        }

        if let Err(e) = job.apply(to, update, Utc::now()) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e.into());
        }

        let stored = Self::write_job(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored)
    }

    #[instrument(skip(self, lease), fields(job_id = %id, expected = %expected), err)]
    async fn refresh(
        &self,
        id: JobId,
        expected: JobState,
        lease: Option<Lease>,
    ) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            UPDATE jobs SET
                visibility_deadline = COALESCE($4, visibility_deadline),
                updated_at = $5,
                version = version + 1
            WHERE id = $1
                AND state = $2
                AND ($3::uuid IS NULL OR lease_owner = $3)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(expected.as_str())
            .bind(lease.map(|l| *l.owner.as_uuid()))
            .bind(lease.map(|l| l.deadline))
            .bind(Utc::now())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("refresh", e))?;

        match row {
            Some(row) => job_from_row(&row),
            // Nothing matched: tell "gone" apart from "moved on".
            None => {
                let current = self.get_job(id).await?;
                Err(StoreError::Conflict {
                    id,
                    expected,
                    actual: current.state,
                })
            }
        }
    }

    fn list_jobs(&self, filter: JobFilter) -> BoxStream<'_, Result<Job, StoreError>> {
        sqlx::query(LIST_JOBS_SQL.as_str())
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.kind)
            .bind(filter.deadline_before)
            .bind(filter.updated_before)
            .bind(filter.limit.map(|l| l as i64))
            .fetch(&*self.pool)
            .map(|row| {
                let row = row.map_err(|e| map_sqlx_error("list_jobs", e))?;
                job_from_row(&row)
            })
            .boxed()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM jobs GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| StoreError::Storage(format!("failed to read state: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| StoreError::Storage(format!("failed to read count: {e}")))?;
            stats.record(state.parse()?, total as u64);
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => StoreError::Storage(format!("{msg} (check constraint)")),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("postgres unreachable in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize job row: {e}")))?;
    row.try_into()
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    kind: String,
    state: String,
    payload_schema: String,
    payload: Vec<u8>,
    result_schema: Option<String>,
    result: Option<Vec<u8>>,
    error: Option<Json<JobError>>,
    last_error: Option<Json<JobError>>,
    attempt_count: i32,
    max_attempts: i32,
    visibility_deadline: Option<DateTime<Utc>>,
    lease_owner: Option<uuid::Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            payload_schema: row.try_get("payload_schema")?,
            payload: row.try_get("payload")?,
            result_schema: row.try_get("result_schema")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            last_error: row.try_get("last_error")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            visibility_deadline: row.try_get("visibility_deadline")?,
            lease_owner: row.try_get("lease_owner")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let result = match (row.result_schema, row.result) {
            (Some(schema), Some(bytes)) => Some(Payload::new(schema, bytes)),
            (None, None) => None,
            _ => {
                return Err(StoreError::Storage(format!(
                    "job {} has a result without a schema (or vice versa)",
                    row.id
                )));
            }
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            kind: row.kind,
            state: row.state.parse()?,
            payload: Payload::new(row.payload_schema, row.payload),
            result,
            error: row.error.map(|e| e.0),
            last_error: row.last_error.map(|e| e.0),
            attempt_count: row.attempt_count as u32,
            max_attempts: row.max_attempts as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            visibility_deadline: row.visibility_deadline,
            lease_owner: row.lease_owner.map(WorkerId::from_uuid),
            version: row.version as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    /// Runs against a live database only when `TEST_DATABASE_URL` is set.
    async fn store() -> Option<PostgresJobStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PostgresJobStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn listing_streams_rows_oldest_first() {
        let Some(store) = store().await else { return };
        let kind = format!("listing.{}", uuid::Uuid::now_v7().simple());

        let mut created = Vec::new();
        for n in 0..3 {
            let job = store
                .create_job(NewJob {
                    kind: kind.clone(),
                    payload: Payload::json(&serde_json::json!({ "n": n })).unwrap(),
                    max_attempts: 1,
                })
                .await
                .unwrap();
            created.push(job.id);
        }

        let mut stream = store.list_jobs(JobFilter::default().with_kind(kind.clone()));
        let first = stream.try_next().await.unwrap().unwrap();
        assert_eq!(first.id, created[0]);
        let rest: Vec<Job> = stream.try_collect().await.unwrap();
        assert_eq!(rest.iter().map(|j| j.id).collect::<Vec<_>>(), created[1..]);

        let limited: Vec<Job> = store
            .list_jobs(JobFilter::state(JobState::Pending).with_kind(kind).limit(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
