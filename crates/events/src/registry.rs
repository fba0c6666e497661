//! Per-job progress channels.
//!
//! [`ProgressRegistry`] is shared via `Arc<ProgressRegistry>` between the
//! scheduler (publisher) and any number of subscribers. Each subscriber owns
//! a bounded progress channel plus a one-shot terminal slot, so a slow
//! subscriber loses intermediate progress but never the terminal event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lectern_core::types::JobId;
use lectern_db::models::job::JobSnapshot;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;

/// How long a finished job's terminal snapshot is kept for late subscribers.
pub const TERMINAL_RETENTION: Duration = Duration::from_secs(60);

/// Default per-subscriber progress buffer.
const DEFAULT_BUFFER: usize = 64;

/// Identifies one subscription so it can be removed again.
pub type SubscriptionId = u64;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

struct Subscriber {
    id: SubscriptionId,
    progress: mpsc::Sender<JobSnapshot>,
    terminal: oneshot::Sender<JobSnapshot>,
}

#[derive(Default)]
struct Entry {
    subscribers: Vec<Subscriber>,
    /// Set once the job reached a terminal state. Further publishes are
    /// ignored.
    finished: Option<(JobSnapshot, Instant)>,
}

// ---------------------------------------------------------------------------
// JobEventStream
// ---------------------------------------------------------------------------

/// Receiving half of a job subscription.
///
/// [`recv`](Self::recv) yields progress snapshots in publish order, then the
/// terminal snapshot, then `None`. It also returns `None` once the
/// subscription has been removed with [`ProgressRegistry::unsubscribe`].
#[derive(Debug)]
pub struct JobEventStream {
    job_id: JobId,
    id: SubscriptionId,
    progress: mpsc::Receiver<JobSnapshot>,
    terminal: Option<oneshot::Receiver<JobSnapshot>>,
}

impl JobEventStream {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event for the job, or `None` when the stream is finished.
    pub async fn recv(&mut self) -> Option<JobSnapshot> {
        if let Some(snapshot) = self.progress.recv().await {
            return Some(snapshot);
        }
        // The progress sender is dropped only after the terminal slot was
        // filled or the subscription removed.
        let terminal = self.terminal.take()?;
        terminal.await.ok()
    }
}

// ---------------------------------------------------------------------------
// ProgressRegistry
// ---------------------------------------------------------------------------

/// In-memory mapping from job id to live subscriber channels.
///
/// Entries are created by the first [`subscribe`](Self::subscribe) and
/// removed when the last subscriber leaves a running job, or when a finished
/// job's retention window has passed.
pub struct ProgressRegistry {
    entries: Mutex<HashMap<JobId, Entry>>,
    buffer: usize,
    retention: Duration,
    next_id: AtomicU64,
}

impl ProgressRegistry {
    /// Create a registry whose subscribers buffer up to `buffer` progress
    /// events each.
    pub fn new(buffer: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            retention: TERMINAL_RETENTION,
            next_id: AtomicU64::new(1),
        }
    }

    /// Override the terminal retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        // Critical sections never panic midway; a poisoned map is still
        // consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(&self, entries: &mut HashMap<JobId, Entry>) {
        let retention = self.retention;
        entries.retain(|_, entry| match &entry.finished {
            Some((_, at)) => at.elapsed() < retention,
            None => true,
        });
    }

    /// Register a new subscriber for `job_id`.
    ///
    /// If the job already finished within the retention window the stream
    /// is returned already holding the terminal snapshot.
    pub fn subscribe(&self, job_id: JobId) -> JobEventStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (progress_tx, progress_rx) = mpsc::channel(self.buffer);
        let (terminal_tx, terminal_rx) = oneshot::channel();

        let mut entries = self.entries();
        self.prune(&mut entries);
        let entry = entries.entry(job_id).or_default();

        match &entry.finished {
            Some((snapshot, _)) => {
                let _ = terminal_tx.send(snapshot.clone());
                drop(progress_tx);
            }
            None => entry.subscribers.push(Subscriber {
                id,
                progress: progress_tx,
                terminal: terminal_tx,
            }),
        }

        tracing::debug!(job_id = %job_id, subscription = id, "Job subscriber registered");

        JobEventStream {
            job_id,
            id,
            progress: progress_rx,
            terminal: Some(terminal_rx),
        }
    }

    /// Remove a subscription. The stream's `recv` returns `None` after any
    /// already-buffered progress.
    pub fn unsubscribe(&self, job_id: JobId, subscription: SubscriptionId) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&job_id) else {
            return;
        };
        entry.subscribers.retain(|sub| sub.id != subscription);
        if entry.subscribers.is_empty() && entry.finished.is_none() {
            entries.remove(&job_id);
        }
    }

    /// Fan `snapshot` out to every subscriber of its job.
    ///
    /// Never blocks. A subscriber whose buffer is full misses this progress
    /// event. A terminal snapshot is delivered through each subscriber's
    /// terminal slot, closes every stream and seals the entry; publishes for
    /// a sealed entry are ignored, which makes terminal publishing
    /// idempotent.
    pub fn publish(&self, snapshot: JobSnapshot) {
        let job_id = snapshot.id;
        let mut entries = self.entries();

        if snapshot.is_terminal() {
            self.prune(&mut entries);
            let entry = entries.entry(job_id).or_default();
            if entry.finished.is_some() {
                return;
            }
            let subscribers = std::mem::take(&mut entry.subscribers);
            let delivered = subscribers.len();
            for sub in subscribers {
                let _ = sub.terminal.send(snapshot.clone());
            }
            tracing::debug!(
                job_id = %job_id,
                status = %snapshot.status,
                subscribers = delivered,
                "Published terminal job event",
            );
            entry.finished = Some((snapshot, Instant::now()));
            return;
        }

        let Some(entry) = entries.get_mut(&job_id) else {
            return;
        };
        if entry.finished.is_some() {
            return;
        }
        entry.subscribers.retain(|sub| match sub.progress.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(
                    job_id = %job_id,
                    subscription = sub.id,
                    "Subscriber buffer full, dropping progress event",
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if entry.subscribers.is_empty() {
            entries.remove(&job_id);
        }
    }

    /// Number of live subscribers for `job_id`.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.entries()
            .get(&job_id)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Whether a terminal snapshot is currently retained for `job_id`.
    pub fn is_finished(&self, job_id: JobId) -> bool {
        self.entries()
            .get(&job_id)
            .is_some_and(|entry| entry.finished.is_some())
    }
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use lectern_db::models::job::JobMetrics;
    use lectern_db::models::status::JobStatus;

    use super::*;

    fn snapshot(id: JobId, status: JobStatus, progress: i16) -> JobSnapshot {
        JobSnapshot {
            id,
            job_type: "export".into(),
            status,
            owner_id: 1,
            exam_id: None,
            lecture_id: None,
            payload: serde_json::json!({}),
            progress,
            progress_message: format!("{progress}%"),
            result: None,
            error: None,
            metrics: JobMetrics::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn progress_then_terminal_then_end() {
        let registry = ProgressRegistry::default();
        let id = uuid::Uuid::new_v4();
        let mut stream = registry.subscribe(id);

        registry.publish(snapshot(id, JobStatus::Running, 10));
        registry.publish(snapshot(id, JobStatus::Running, 20));
        registry.publish(snapshot(id, JobStatus::Completed, 100));

        assert_eq!(stream.recv().await.unwrap().progress, 10);
        assert_eq!(stream.recv().await.unwrap().progress, 20);
        assert_eq!(stream.recv().await.unwrap().status, JobStatus::Completed);
        assert!(stream.recv().await.is_none());
        assert_eq!(registry.subscriber_count(id), 0);
    }

    #[tokio::test]
    async fn publishes_after_terminal_are_ignored() {
        let registry = ProgressRegistry::default();
        let id = uuid::Uuid::new_v4();
        let mut stream = registry.subscribe(id);

        registry.publish(snapshot(id, JobStatus::Cancelled, 30));
        registry.publish(snapshot(id, JobStatus::Running, 40));
        registry.publish(snapshot(id, JobStatus::Failed, 40));

        assert_eq!(stream.recv().await.unwrap().status, JobStatus::Cancelled);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn late_subscriber_gets_retained_terminal() {
        let registry = ProgressRegistry::default();
        let id = uuid::Uuid::new_v4();

        registry.publish(snapshot(id, JobStatus::Failed, 40));
        assert!(registry.is_finished(id));

        let mut stream = registry.subscribe(id);
        assert_eq!(stream.recv().await.unwrap().status, JobStatus::Failed);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn retention_expires() {
        let registry = ProgressRegistry::default().with_retention(Duration::ZERO);
        let id = uuid::Uuid::new_v4();

        registry.publish(snapshot(id, JobStatus::Completed, 100));
        let mut stream = registry.subscribe(id);

        assert!(!registry.is_finished(id));
        assert_eq!(registry.subscriber_count(id), 1);

        registry.publish(snapshot(id, JobStatus::Completed, 100));
        assert_eq!(stream.recv().await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn full_subscriber_drops_progress_but_keeps_terminal() {
        let registry = ProgressRegistry::new(2);
        let id = uuid::Uuid::new_v4();
        let mut slow = registry.subscribe(id);

        for progress in 1..=10 {
            registry.publish(snapshot(id, JobStatus::Running, progress));
        }
        registry.publish(snapshot(id, JobStatus::Completed, 100));

        assert_eq!(slow.recv().await.unwrap().progress, 1);
        assert_eq!(slow.recv().await.unwrap().progress, 2);
        assert_eq!(slow.recv().await.unwrap().status, JobStatus::Completed);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_closes_stream_and_drops_entry() {
        let registry = ProgressRegistry::default();
        let id = uuid::Uuid::new_v4();
        let mut a = registry.subscribe(id);
        let b = registry.subscribe(id);
        assert_eq!(registry.subscriber_count(id), 2);

        registry.unsubscribe(id, a.id());
        assert!(a.recv().await.is_none());
        assert_eq!(registry.subscriber_count(id), 1);

        registry.unsubscribe(id, b.id());
        assert_eq!(registry.subscriber_count(id), 0);
        assert!(!registry.is_finished(id));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let registry = ProgressRegistry::default();
        registry.publish(snapshot(uuid::Uuid::new_v4(), JobStatus::Running, 5));
    }
}
