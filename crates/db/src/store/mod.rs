//! The job-persistence seam used by the scheduler.
//!
//! [`JobStore`] mirrors [`JobRepo`] one-to-one so that the scheduler can be
//! driven by Postgres in production ([`PgJobStore`]) and by
//! [`MemoryJobStore`] in tests or single-process embeddings.

mod memory;

use async_trait::async_trait;
use lectern_core::types::{DbId, JobId};

use crate::models::job::{Job, JobListQuery, JobMetrics, JobOutcome, NewJob};
use crate::repositories::JobRepo;
use crate::DbPool;

pub use memory::MemoryJobStore;

/// Durable job storage.
///
/// All writes touch a single row. Status writes are conditional on the
/// current status and return `None`/`false` when the condition no longer
/// holds, which makes them safe to retry.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, input: &NewJob) -> Result<Job, sqlx::Error>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, sqlx::Error>;

    /// `PENDING -> RUNNING`; `None` if the job is not pending.
    async fn mark_running(&self, id: JobId) -> Result<Option<Job>, sqlx::Error>;

    /// `PENDING -> CANCELLED`; `None` if the job is not pending.
    async fn cancel_pending(&self, id: JobId) -> Result<Option<Job>, sqlx::Error>;

    /// Monotonic progress update; `false` if the job is not running.
    async fn update_progress(
        &self,
        id: JobId,
        percent: i16,
        message: &str,
    ) -> Result<bool, sqlx::Error>;

    async fn update_metrics(&self, id: JobId, metrics: &JobMetrics) -> Result<bool, sqlx::Error>;

    /// Terminal write; `None` if the job was already terminal.
    async fn finish(&self, id: JobId, outcome: &JobOutcome) -> Result<Option<Job>, sqlx::Error>;

    async fn list_unfinished(&self) -> Result<Vec<Job>, sqlx::Error>;

    async fn list_by_owner(
        &self,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, sqlx::Error>;
}

/// [`JobStore`] backed by the Postgres `jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, input: &NewJob) -> Result<Job, sqlx::Error> {
        JobRepo::create(&self.pool, input).await
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::find_by_id(&self.pool, id).await
    }

    async fn mark_running(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::mark_running(&self.pool, id).await
    }

    async fn cancel_pending(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::cancel_pending(&self.pool, id).await
    }

    async fn update_progress(
        &self,
        id: JobId,
        percent: i16,
        message: &str,
    ) -> Result<bool, sqlx::Error> {
        JobRepo::update_progress(&self.pool, id, percent, message).await
    }

    async fn update_metrics(&self, id: JobId, metrics: &JobMetrics) -> Result<bool, sqlx::Error> {
        JobRepo::update_metrics(&self.pool, id, metrics).await
    }

    async fn finish(&self, id: JobId, outcome: &JobOutcome) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::finish(&self.pool, id, outcome).await
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, sqlx::Error> {
        JobRepo::list_unfinished(&self.pool).await
    }

    async fn list_by_owner(
        &self,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, sqlx::Error> {
        JobRepo::list_by_owner(&self.pool, owner_id, params).await
    }
}
