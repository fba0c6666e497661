//! Repository for the `jobs` table.
//!
//! Every status write is a single conditional `UPDATE` keyed on the current
//! status, so the state machine is enforced by the database and retries of
//! the same write are harmless.

use sqlx::PgPool;
use lectern_core::types::{DbId, JobId};

use crate::models::job::{Job, JobListQuery, JobMetrics, JobOutcome, NewJob};
use crate::models::status::{JobStatus, TERMINAL_JOB_STATUSES};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, job_type, status_id, owner_id, exam_id, lecture_id, payload, \
    progress, progress_message, result, error, metrics, \
    created_at, started_at, completed_at, updated_at";

/// Maximum page size for job listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
const DEFAULT_LIMIT: i64 = 50;

/// Provides persistence operations for background jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new `PENDING` job and return the stored row.
    pub async fn create(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (id, job_type, status_id, owner_id, exam_id, lecture_id, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.id)
            .bind(&input.job_type)
            .bind(JobStatus::Pending.id())
            .bind(input.owner_id)
            .bind(input.exam_id)
            .bind(input.lecture_id)
            .bind(&input.payload)
            .fetch_one(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Compare-and-swap `PENDING -> RUNNING`, recording `started_at`.
    ///
    /// Returns `None` when the job is no longer pending (a cancellation won
    /// the race), in which case the worker must skip it.
    pub async fn mark_running(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, started_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Running.id())
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Compare-and-swap `PENDING -> CANCELLED` for a job no worker has
    /// picked up yet.
    pub async fn cancel_pending(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Cancelled.id())
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Update progress percentage and message of a running job.
    ///
    /// The stored percentage never decreases. Returns `false` when the job
    /// is not running (late update after a terminal write).
    pub async fn update_progress(
        pool: &PgPool,
        id: JobId,
        percent: i16,
        message: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET progress = GREATEST(progress, $2), progress_message = $3, updated_at = NOW() \
             WHERE id = $1 AND status_id = $4",
        )
        .bind(id)
        .bind(percent)
        .bind(message)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the accumulated usage counters of a running job.
    pub async fn update_metrics(
        pool: &PgPool,
        id: JobId,
        metrics: &JobMetrics,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET metrics = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(metrics.to_json())
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write a terminal status with its result or error.
    ///
    /// Only non-terminal rows are updated, so a terminal status is never
    /// overwritten. A completed job has its progress pinned to 100. Returns
    /// `None` when the row was already terminal or does not exist.
    pub async fn finish(
        pool: &PgPool,
        id: JobId,
        outcome: &JobOutcome,
    ) -> Result<Option<Job>, sqlx::Error> {
        let (result, error) = outcome.columns();
        let status = outcome.status();
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, result = $3, error = $4, \
                 progress = CASE WHEN $2 = $5 THEN 100 ELSE progress END, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id NOT IN ($6, $7, $8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(status.id())
            .bind(result)
            .bind(error)
            .bind(JobStatus::Completed.id())
            .bind(TERMINAL_JOB_STATUSES[0].id())
            .bind(TERMINAL_JOB_STATUSES[1].id())
            .bind(TERMINAL_JOB_STATUSES[2].id())
            .fetch_optional(pool)
            .await
    }

    /// All jobs still pending or running, oldest first. Used for start-up
    /// recovery.
    pub async fn list_unfinished(pool: &PgPool) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status_id IN ($1, $2) \
             ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Pending.id())
            .bind(JobStatus::Running.id())
            .fetch_all(pool)
            .await
    }

    /// List jobs for a specific owner with optional status filter and pagination.
    pub async fn list_by_owner(
        pool: &PgPool,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let (limit, offset) = page_bounds(params);

        let mut conditions: Vec<String> = vec!["owner_id = $1".to_string()];
        let mut bind_idx: u32 = 2;

        if params.status.is_some() {
            conditions.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }

        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE {} \
             ORDER BY created_at DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            conditions.join(" AND "),
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, Job>(&query).bind(owner_id);
        if let Some(status) = params.status {
            q = q.bind(status.id());
        }
        q = q.bind(limit).bind(offset);

        q.fetch_all(pool).await
    }
}

/// Clamp the requested page to `[1, MAX_LIMIT]` and a non-negative offset.
pub fn page_bounds(params: &JobListQuery) -> (i64, i64) {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);
    (limit, offset)
}
