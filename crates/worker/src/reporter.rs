//! Progress reporting handed to running handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use lectern_core::types::JobId;
use lectern_db::models::job::{JobMetrics, JobOutcome, JobSnapshot};
use lectern_db::models::status::JobStatus;
use lectern_db::store::JobStore;
use lectern_events::ProgressRegistry;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Persists and publishes progress for one running job.
///
/// Cheap to clone; every clone reports into the same job. Updates are
/// serialized so persistence and publication happen in call order.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterState>,
}

struct ReporterState {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    registry: Arc<ProgressRegistry>,
    cancel: CancellationToken,
    /// Latest known view of the job, updated by every report.
    current: Mutex<JobSnapshot>,
    /// Set once the job's terminal state has been decided.
    closed: AtomicBool,
}

impl ProgressReporter {
    pub(crate) fn new(
        snapshot: JobSnapshot,
        store: Arc<dyn JobStore>,
        registry: Arc<ProgressRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterState {
                job_id: snapshot.id,
                store,
                registry,
                cancel,
                current: Mutex::new(snapshot),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    fn accepts_updates(&self) -> bool {
        !self.inner.cancel.is_cancelled() && !self.inner.closed.load(Ordering::Acquire)
    }

    /// Record progress and notify subscribers.
    ///
    /// `percent` is capped at 100 and never moves backwards. Updates after
    /// cancellation or completion are discarded. A failed write is logged
    /// and does not interrupt the handler.
    pub async fn report_progress(&self, percent: u8, message: impl Into<String>) {
        if !self.accepts_updates() {
            return;
        }
        let message = message.into();
        let mut current = self.inner.current.lock().await;
        let percent = i16::from(percent.min(100)).max(current.progress);
        current.progress = percent;
        current.progress_message = message;

        match self
            .inner
            .store
            .update_progress(self.inner.job_id, percent, &current.progress_message)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %self.inner.job_id, "Progress for non-running job ignored");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %self.inner.job_id,
                    error = %e,
                    "Failed to persist job progress",
                );
            }
        }

        if self.accepts_updates() {
            self.inner.registry.publish(current.clone());
        }
    }

    /// Add `partial` onto the job's usage counters and persist the totals.
    pub async fn report_metrics(&self, partial: &JobMetrics) {
        if self.inner.closed.load(Ordering::Acquire) || partial.is_empty() {
            return;
        }
        let mut current = self.inner.current.lock().await;
        current.metrics.accumulate(partial);

        if let Err(e) = self
            .inner
            .store
            .update_metrics(self.inner.job_id, &current.metrics)
            .await
        {
            tracing::warn!(
                job_id = %self.inner.job_id,
                error = %e,
                "Failed to persist job metrics",
            );
        }
    }

    /// Latest progress view of the job.
    pub async fn snapshot(&self) -> JobSnapshot {
        self.inner.current.lock().await.clone()
    }

    /// Stop accepting updates and build the terminal view for `outcome`
    /// from the last reported state.
    pub(crate) async fn close(&self, outcome: &JobOutcome) -> JobSnapshot {
        self.inner.closed.store(true, Ordering::Release);
        let mut snapshot = self.inner.current.lock().await.clone();
        let (result, error) = outcome.columns();
        snapshot.status = outcome.status();
        snapshot.result = result.cloned();
        snapshot.error = error.map(str::to_string);
        if snapshot.status == JobStatus::Completed {
            snapshot.progress = 100;
        }
        snapshot.completed_at = Some(Utc::now());
        snapshot
    }
}
