//! Job entity models and DTOs for the asynchronous job scheduler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use lectern_core::types::{DbId, JobId, Timestamp};

use super::status::{JobStatus, StatusId};

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status_id: StatusId,
    pub owner_id: DbId,
    pub exam_id: Option<DbId>,
    pub lecture_id: Option<DbId>,
    pub payload: serde_json::Value,
    pub progress: i16,
    pub progress_message: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metrics: serde_json::Value,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Job {
    /// Decoded status. Rows always carry a seeded status id, so an unknown
    /// id is reported as `Pending` rather than failing the whole read.
    pub fn status(&self) -> JobStatus {
        JobStatus::from_id(self.status_id).unwrap_or(JobStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Usage counters accumulated so far. A malformed column reads as empty.
    pub fn metrics(&self) -> JobMetrics {
        serde_json::from_value(self.metrics.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from(self)
    }
}

/// Insert payload for a new job. The id is generated by the caller so the
/// scheduler can log it before the row exists.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub job_type: String,
    pub owner_id: DbId,
    pub exam_id: Option<DbId>,
    pub lecture_id: Option<DbId>,
    pub payload: serde_json::Value,
}

/// Associated resource ids recorded on a job for consumers' authorization
/// checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedIds {
    pub exam_id: Option<DbId>,
    pub lecture_id: Option<DbId>,
}

/// Terminal result of running a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled(Option<String>),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Cancelled(_) => JobStatus::Cancelled,
        }
    }

    /// Split into the `(result, error)` column pair.
    pub fn columns(&self) -> (Option<&serde_json::Value>, Option<&str>) {
        match self {
            JobOutcome::Completed(result) => (Some(result), None),
            JobOutcome::Failed(error) => (None, Some(error.as_str())),
            JobOutcome::Cancelled(reason) => (None, reason.as_deref()),
        }
    }
}

/// Named usage counters (resource units, tokens, cost, ...) reported by a
/// handler. The scheduler sums partial reports and never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobMetrics(pub BTreeMap<String, f64>);

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, used by handlers to assemble a partial report.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Add every counter of `partial` onto `self`.
    pub fn accumulate(&mut self, partial: &JobMetrics) {
        for (name, value) in &partial.0 {
            *self.0.entry(name.clone()).or_insert(0.0) += value;
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Public view of a job: the REST response body and the WebSocket
/// `job:progress` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub owner_id: DbId,
    pub exam_id: Option<DbId>,
    pub lecture_id: Option<DbId>,
    pub payload: serde_json::Value,
    pub progress: i16,
    pub progress_message: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metrics: JobMetrics,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            status: job.status(),
            owner_id: job.owner_id,
            exam_id: job.exam_id,
            lecture_id: job.lecture_id,
            payload: job.payload.clone(),
            progress: job.progress,
            progress_message: job.progress_message.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            metrics: job.metrics(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Query parameters for listing a user's jobs.
#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    /// Filter by status name (e.g. `FAILED`).
    pub status: Option<JobStatus>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_accumulate_by_name() {
        let mut total = JobMetrics::new().with("tokens", 100.0);
        total.accumulate(&JobMetrics::new().with("tokens", 50.0).with("cost_usd", 0.25));
        total.accumulate(&JobMetrics::new().with("cost_usd", 0.25));

        assert_eq!(total.get("tokens"), Some(150.0));
        assert_eq!(total.get("cost_usd"), Some(0.5));
        assert_eq!(total.to_json(), serde_json::json!({"cost_usd": 0.5, "tokens": 150.0}));
    }

    #[test]
    fn outcome_columns_are_mutually_exclusive() {
        let done = JobOutcome::Completed(serde_json::json!({"pages": 3}));
        assert_eq!(done.columns(), (Some(&serde_json::json!({"pages": 3})), None));
        assert_eq!(done.status(), JobStatus::Completed);

        let failed = JobOutcome::Failed("boom".into());
        assert_eq!(failed.columns(), (None, Some("boom")));

        let cancelled = JobOutcome::Cancelled(None);
        assert_eq!(cancelled.columns(), (None, None));
        assert_eq!(cancelled.status(), JobStatus::Cancelled);
    }

    #[test]
    fn list_query_parses_status_name() {
        let query: JobListQuery =
            serde_json::from_value(serde_json::json!({"status": "RUNNING", "limit": 10}))
                .unwrap();
        assert_eq!(query.status, Some(JobStatus::Running));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, None);
    }
}
