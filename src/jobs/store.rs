use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::db::models::JobRow;
use crate::jobs::model::{DedupPolicy, Job, NewJob};

const JOB_COLUMNS: &str = "id, kind, user_id, payload, state, progress, attempts, max_attempts, \
                           stalled_count, result, failure_reason, available_at, locked_until, \
                           created_at, updated_at";

/// Job store errors
#[derive(Debug)]
pub enum StoreError {
    /// Backend operation failed
    Database(sqlx::Error),

    /// Enqueue collided with an existing job under `DedupPolicy::Reject`
    DuplicateJob(String),

    /// A stored row carries a state or payload this code cannot read
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(err) => write!(f, "job store error: {}", err),
            StoreError::DuplicateJob(id) => write!(f, "job {} is already queued", id),
            StoreError::Corrupt(msg) => write!(f, "corrupt job record: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err)
    }
}

/// Jobs reclaimed by one stall sweep
#[derive(Debug, Default, Clone, Copy)]
pub struct StallSweep {
    pub requeued: u64,
    pub failed: u64,
}

/// Durable job-id -> job state mapping shared by the request process and
/// the worker process. All mutation goes through these operations; the
/// lease taken by `lease_next` is the only thing preventing two workers
/// from running the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Probe backend availability. The dispatcher calls this fresh on
    /// every submission so backend recovery is picked up without a
    /// restart.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert a job in `waiting` and return its id. Id collisions follow
    /// the store's dedup policy.
    async fn enqueue(&self, new: NewJob) -> Result<String, StoreError>;

    /// Lease the oldest ready job: move it to `active`, count the attempt
    /// and hold a lock until `lock_duration` elapses.
    async fn lease_next(&self, lock_duration: Duration) -> Result<Option<Job>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Raise progress on an active job. Terminal jobs are untouched and
    /// values below the current progress are ignored, so observed
    /// progress never decreases.
    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), StoreError>;

    /// Transition to `completed` with a result payload. No-op once the
    /// job is terminal.
    async fn complete(&self, id: &str, result: serde_json::Value) -> Result<(), StoreError>;

    /// Transition to `failed` with the last error message. No-op once the
    /// job is terminal.
    async fn fail(&self, id: &str, reason: &str) -> Result<(), StoreError>;

    /// Release an active job back to `waiting`, re-deliverable once
    /// `delay` has passed.
    async fn retry_later(&self, id: &str, delay: Duration) -> Result<(), StoreError>;

    /// Requeue active jobs whose lease expired; jobs already requeued
    /// `max_stalled` times are marked failed instead.
    async fn reclaim_stalled(&self, max_stalled: u32) -> Result<StallSweep, StoreError>;

    /// Delete terminal jobs older than `max_age`, at most `max_count` per
    /// invocation.
    async fn cleanup(&self, max_age: Duration, max_count: u32) -> Result<u64, StoreError>;
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn row_to_job(row: JobRow) -> Result<Job, StoreError> {
    let kind = row
        .kind
        .parse()
        .map_err(|err: String| StoreError::Corrupt(err))?;
    let state = row
        .state
        .parse()
        .map_err(|err: String| StoreError::Corrupt(err))?;
    let payload = serde_json::from_value(row.payload)
        .map_err(|err| StoreError::Corrupt(format!("payload of job {}: {}", row.id, err)))?;

    Ok(Job {
        id: row.id,
        kind,
        user_id: row.user_id,
        payload,
        state,
        progress: row.progress.clamp(0, 100) as u8,
        attempts: row.attempts.max(0) as u32,
        max_attempts: row.max_attempts.max(0) as u32,
        stalled_count: row.stalled_count.max(0) as u32,
        result: row.result,
        failure_reason: row.failure_reason,
        created_at: row.created_at,
    })
}

/// Postgres-backed job store
///
/// Leasing uses `FOR UPDATE SKIP LOCKED` plus a `locked_until` deadline:
/// the row update is atomic, so at most one worker owns a job, and an
/// expired deadline is what the stall sweep looks for.
pub struct PgJobStore {
    pool: Pool<Postgres>,
    dedup: DedupPolicy,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>, dedup: DedupPolicy) -> Self {
        Self { pool, dedup }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn enqueue(&self, new: NewJob) -> Result<String, StoreError> {
        let now = Utc::now();
        let id = new.job_id(now);
        let kind = new.payload.kind();
        let payload = serde_json::to_value(&new.payload)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;

        debug!("Enqueueing job {} for user {}", id, new.user_id);

        let inserted = sqlx::query(
            r#"
            INSERT INTO ai_jobs (id, kind, user_id, payload, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(new.user_id)
        .bind(&payload)
        .bind(new.max_attempts as i32)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return match self.dedup {
                DedupPolicy::Reuse => {
                    debug!("Job {} already queued, reusing", id);
                    Ok(id)
                }
                DedupPolicy::Reject => Err(StoreError::DuplicateJob(id)),
            };
        }

        Ok(id)
    }

    async fn lease_next(&self, lock_duration: Duration) -> Result<Option<Job>, StoreError> {
        let locked_until = after(Utc::now(), lock_duration);

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE ai_jobs SET
                state = 'active',
                attempts = attempts + 1,
                locked_until = $1,
                updated_at = now()
            WHERE id = (
                SELECT id FROM ai_jobs
                WHERE state = 'waiting' AND available_at <= now()
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(locked_until)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job).transpose()
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM ai_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job).transpose()
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE ai_jobs SET
                progress = GREATEST(progress, $2),
                updated_at = now()
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(progress.min(100) as i16)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete(&self, id: &str, result: serde_json::Value) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE ai_jobs SET
                state = 'completed',
                progress = 100,
                result = $2,
                locked_until = NULL,
                updated_at = now()
            WHERE id = $1 AND state IN ('waiting', 'active')
            "#,
        )
        .bind(id)
        .bind(&result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            debug!("Job {} already terminal, ignoring completion", id);
        }

        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE ai_jobs SET
                state = 'failed',
                failure_reason = $2,
                locked_until = NULL,
                updated_at = now()
            WHERE id = $1 AND state IN ('waiting', 'active')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            debug!("Job {} already terminal, ignoring failure", id);
        }

        Ok(())
    }

    async fn retry_later(&self, id: &str, delay: Duration) -> Result<(), StoreError> {
        let available_at = after(Utc::now(), delay);

        sqlx::query(
            r#"
            UPDATE ai_jobs SET
                state = 'waiting',
                available_at = $2,
                locked_until = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reclaim_stalled(&self, max_stalled: u32) -> Result<StallSweep, StoreError> {
        let now = Utc::now();

        // Jobs over the stall budget fail first so the requeue below
        // cannot pick them up.
        let failed = sqlx::query(
            r#"
            UPDATE ai_jobs SET
                state = 'failed',
                failure_reason = 'job stalled: worker lease expired too many times',
                locked_until = NULL,
                updated_at = now()
            WHERE state = 'active' AND locked_until < $1 AND stalled_count >= $2
            "#,
        )
        .bind(now)
        .bind(max_stalled as i32)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE ai_jobs SET
                state = 'waiting',
                stalled_count = stalled_count + 1,
                available_at = $1,
                locked_until = NULL,
                updated_at = now()
            WHERE state = 'active' AND locked_until < $1 AND stalled_count < $2
            "#,
        )
        .bind(now)
        .bind(max_stalled as i32)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(StallSweep { requeued, failed })
    }

    async fn cleanup(&self, max_age: Duration, max_count: u32) -> Result<u64, StoreError> {
        let cutoff = before(Utc::now(), max_age);

        let removed = sqlx::query(
            r#"
            DELETE FROM ai_jobs WHERE id IN (
                SELECT id FROM ai_jobs
                WHERE state IN ('completed', 'failed') AND updated_at < $1
                ORDER BY updated_at
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(max_count as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(removed)
    }
}
