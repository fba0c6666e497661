//! In-process [`JobStore`] with the same conditional-write semantics as
//! the Postgres repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use lectern_core::types::{DbId, JobId};

use super::JobStore;
use crate::models::job::{Job, JobListQuery, JobMetrics, JobOutcome, NewJob};
use crate::models::status::JobStatus;
use crate::repositories::job_repo::page_bounds;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Every status a job has held, in order, starting with `PENDING`.
    history: HashMap<JobId, Vec<JobStatus>>,
}

impl Inner {
    fn set_status(&mut self, id: JobId, status: JobStatus) {
        self.history.entry(id).or_default().push(status);
    }
}

/// Job storage held in a `HashMap`.
///
/// Besides serving tests, it exposes fault injection
/// ([`fail_next_finishes`](Self::fail_next_finishes),
/// [`set_progress_failing`](Self::set_progress_failing)) and the recorded
/// status history of each job.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
    failing_finishes: AtomicUsize,
    failing_progress: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is, bypassing the state machine. Used to seed rows
    /// left behind by a previous process.
    pub async fn insert(&self, job: Job) {
        let mut inner = self.inner.write().await;
        let status = job.status();
        inner.history.insert(job.id, vec![status]);
        inner.jobs.insert(job.id, job);
    }

    /// Make the next `count` calls to [`JobStore::finish`] fail.
    pub fn fail_next_finishes(&self, count: usize) {
        self.failing_finishes.store(count, Ordering::SeqCst);
    }

    /// Make every progress and metrics write fail until reset.
    pub fn set_progress_failing(&self, failing: bool) {
        self.failing_progress.store(failing, Ordering::SeqCst);
    }

    /// Status history of a job, oldest first.
    pub async fn status_history(&self, id: JobId) -> Vec<JobStatus> {
        self.inner
            .read()
            .await
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn injected_failure(what: &str) -> sqlx::Error {
        sqlx::Error::Protocol(format!("injected {what} failure"))
    }

    fn take_finish_failure(&self) -> bool {
        self.failing_finishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, input: &NewJob) -> Result<Job, sqlx::Error> {
        let now = Utc::now();
        let job = Job {
            id: input.id,
            job_type: input.job_type.clone(),
            status_id: JobStatus::Pending.id(),
            owner_id: input.owner_id,
            exam_id: input.exam_id,
            lecture_id: input.lecture_id,
            payload: input.payload.clone(),
            progress: 0,
            progress_message: String::new(),
            result: None,
            error: None,
            metrics: serde_json::json!({}),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone());
        inner.set_status(job.id, JobStatus::Pending);
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn mark_running(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let mut inner = self.inner.write().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status() != JobStatus::Pending {
            return Ok(None);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Running.id();
        job.started_at = Some(now);
        job.updated_at = now;
        let job = job.clone();
        inner.set_status(id, JobStatus::Running);
        Ok(Some(job))
    }

    async fn cancel_pending(&self, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let mut inner = self.inner.write().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status() != JobStatus::Pending {
            return Ok(None);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Cancelled.id();
        job.completed_at = Some(now);
        job.updated_at = now;
        let job = job.clone();
        inner.set_status(id, JobStatus::Cancelled);
        Ok(Some(job))
    }

    async fn update_progress(
        &self,
        id: JobId,
        percent: i16,
        message: &str,
    ) -> Result<bool, sqlx::Error> {
        if self.failing_progress.load(Ordering::SeqCst) {
            return Err(Self::injected_failure("progress"));
        }
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status() == JobStatus::Running => {
                job.progress = job.progress.max(percent);
                job.progress_message = message.to_string();
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_metrics(&self, id: JobId, metrics: &JobMetrics) -> Result<bool, sqlx::Error> {
        if self.failing_progress.load(Ordering::SeqCst) {
            return Err(Self::injected_failure("metrics"));
        }
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status() == JobStatus::Running => {
                job.metrics = metrics.to_json();
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: JobId, outcome: &JobOutcome) -> Result<Option<Job>, sqlx::Error> {
        if self.take_finish_failure() {
            return Err(Self::injected_failure("finish"));
        }
        let mut inner = self.inner.write().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.is_terminal() {
            return Ok(None);
        }
        let (result, error) = outcome.columns();
        let status = outcome.status();
        let now = Utc::now();
        job.status_id = status.id();
        job.result = result.cloned();
        job.error = error.map(str::to_string);
        if status == JobStatus::Completed {
            job.progress = 100;
        }
        job.completed_at = Some(now);
        job.updated_at = now;
        let job = job.clone();
        inner.set_status(id, status);
        Ok(Some(job))
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, sqlx::Error> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn list_by_owner(
        &self,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let (limit, offset) = page_bounds(params);
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.owner_id == owner_id)
            .filter(|job| params.status.map_or(true, |status| job.status() == status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn new_job(owner_id: DbId) -> NewJob {
        NewJob {
            id: uuid::Uuid::new_v4(),
            job_type: "transcription".into(),
            owner_id,
            exam_id: None,
            lecture_id: Some(9),
            payload: serde_json::json!({"language": "en"}),
        }
    }

    #[tokio::test]
    async fn create_starts_pending_with_empty_outcome() {
        let store = MemoryJobStore::new();
        let job = store.create(&new_job(1)).await.unwrap();

        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none() && job.error.is_none());
        assert!(job.started_at.is_none() && job.completed_at.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn mark_running_is_compare_and_swap() {
        let store = MemoryJobStore::new();
        let job = store.create(&new_job(1)).await.unwrap();

        let running = store.mark_running(job.id).await.unwrap().unwrap();
        assert_eq!(running.status(), JobStatus::Running);
        assert!(running.started_at.is_some());

        assert_matches!(store.mark_running(job.id).await, Ok(None));
        assert_matches!(store.cancel_pending(job.id).await, Ok(None));
    }

    #[tokio::test]
    async fn progress_never_decreases_and_requires_running() {
        let store = MemoryJobStore::new();
        let job = store.create(&new_job(1)).await.unwrap();

        assert!(!store.update_progress(job.id, 10, "early").await.unwrap());

        store.mark_running(job.id).await.unwrap();
        assert!(store.update_progress(job.id, 40, "halfway").await.unwrap());
        assert!(store.update_progress(job.id, 20, "stale").await.unwrap());

        let row = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.progress, 40);
        assert_eq!(row.progress_message, "stale");
    }

    #[tokio::test]
    async fn finish_only_applies_once() {
        let store = MemoryJobStore::new();
        let job = store.create(&new_job(1)).await.unwrap();
        store.mark_running(job.id).await.unwrap();

        let done = store
            .finish(job.id, &JobOutcome::Completed(serde_json::json!({"ok": true})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status(), JobStatus::Completed);
        assert_eq!(done.progress, 100);

        assert_matches!(
            store.finish(job.id, &JobOutcome::Failed("late".into())).await,
            Ok(None)
        );
        assert_eq!(
            store.status_history(job.id).await,
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn injected_finish_failures_are_consumed() {
        let store = MemoryJobStore::new();
        let job = store.create(&new_job(1)).await.unwrap();
        store.mark_running(job.id).await.unwrap();
        store.fail_next_finishes(1);

        assert!(store.finish(job.id, &JobOutcome::Failed("x".into())).await.is_err());
        assert!(store
            .finish(job.id, &JobOutcome::Failed("x".into()))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn list_by_owner_filters_and_pages() {
        let store = MemoryJobStore::new();
        for _ in 0..3 {
            store.create(&new_job(1)).await.unwrap();
        }
        let other = store.create(&new_job(2)).await.unwrap();
        store.cancel_pending(other.id).await.unwrap();

        let mine = store
            .list_by_owner(1, &JobListQuery::default())
            .await
            .unwrap();
        assert_eq!(mine.len(), 3);

        let page = JobListQuery {
            limit: Some(2),
            offset: Some(2),
            ..Default::default()
        };
        assert_eq!(store.list_by_owner(1, &page).await.unwrap().len(), 1);

        let cancelled = JobListQuery {
            status: Some(JobStatus::Cancelled),
            ..Default::default()
        };
        assert!(store.list_by_owner(1, &cancelled).await.unwrap().is_empty());
        assert_eq!(store.list_by_owner(2, &cancelled).await.unwrap().len(), 1);
    }
}
