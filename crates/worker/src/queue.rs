//! The job scheduler and its worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use lectern_core::types::{DbId, JobId};
use lectern_db::models::job::{AssociatedIds, Job, JobListQuery, JobOutcome, JobSnapshot, NewJob};
use lectern_db::models::status::JobStatus;
use lectern_db::store::JobStore;
use lectern_events::{JobEventStream, ProgressRegistry};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::WorkerConfig;
use crate::error::{HandlerError, QueueError};
use crate::handler::{HandlerRegistry, JobContext, JobHandler};
use crate::reporter::ProgressReporter;

/// Error recorded for a handler that panicked.
pub const PANIC_ERROR: &str = "internal error while running job";

/// Error recorded for jobs found `RUNNING` at start-up.
pub const INTERRUPTED_ERROR: &str = "interrupted by server restart";

/// Pause before the single retry of a failed terminal write.
const TERMINAL_RETRY_DELAY: Duration = Duration::from_millis(100);

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<JobId>>>;

/// Persisted job scheduler with a fixed-size worker pool.
///
/// Construct with [`JobQueue::start`] and share the returned `Arc`. Only the
/// worker running a job writes its progress and terminal state;
/// [`cancel_job`](Self::cancel_job) writes status only for jobs no worker
/// has picked up.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    registry: Arc<ProgressRegistry>,
    handlers: HandlerRegistry,
    config: WorkerConfig,
    sender: mpsc::Sender<JobId>,
    /// Cancellation tokens of jobs owned by a worker.
    running: Mutex<HashMap<JobId, CancellationToken>>,
    /// Terminal states whose write failed twice. Authoritative for this
    /// process's lifetime.
    unpersisted: RwLock<HashMap<JobId, JobSnapshot>>,
    /// Cancelled when the queue stops accepting work.
    intake: CancellationToken,
    /// Parent of every job token; cancelled when shutdown runs out of time.
    abort: CancellationToken,
    tracker: TaskTracker,
}

impl JobQueue {
    /// Recover unfinished jobs from the store and spawn the worker pool.
    ///
    /// Jobs left `RUNNING` by a previous process are failed; jobs left
    /// `PENDING` are handed to the workers again.
    pub async fn start(
        store: Arc<dyn JobStore>,
        registry: Arc<ProgressRegistry>,
        handlers: HandlerRegistry,
        config: WorkerConfig,
    ) -> Result<Arc<Self>, QueueError> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let queue = Arc::new(Self {
            store,
            registry,
            handlers,
            config,
            sender,
            running: Mutex::new(HashMap::new()),
            unpersisted: RwLock::new(HashMap::new()),
            intake: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let pending = queue.recover().await?;

        for worker in 0..queue.config.worker_count {
            let this = Arc::clone(&queue);
            let receiver = Arc::clone(&receiver);
            queue.tracker.spawn(this.worker_loop(worker, receiver));
        }

        if !pending.is_empty() {
            let this = Arc::clone(&queue);
            queue.tracker.spawn(async move {
                for id in pending {
                    this.dispatch(id).await;
                }
            });
        }

        tracing::info!(
            workers = queue.config.worker_count,
            queue_capacity = queue.config.queue_capacity,
            job_types = ?queue.handlers.job_types(),
            "Job queue started",
        );
        Ok(queue)
    }

    /// Fail interrupted jobs and return the ids of jobs still pending.
    async fn recover(&self) -> Result<Vec<JobId>, QueueError> {
        let unfinished = self.store.list_unfinished().await?;
        let mut pending = Vec::new();

        for job in unfinished {
            match job.status() {
                JobStatus::Running => {
                    let outcome = JobOutcome::Failed(INTERRUPTED_ERROR.into());
                    match self.store.finish(job.id, &outcome).await {
                        Ok(_) => tracing::warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            "Failed job interrupted by restart",
                        ),
                        Err(e) => tracing::error!(
                            job_id = %job.id,
                            error = %e,
                            "Failed to fail interrupted job",
                        ),
                    }
                }
                _ => pending.push(job.id),
            }
        }

        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Re-queueing pending jobs");
        }
        Ok(pending)
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Register (or replace) the handler for `job_type`.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.register(job_type, handler);
    }

    /// Validate, persist and queue a new job.
    ///
    /// Unknown types and payloads rejected by the handler fail with
    /// [`QueueError::Validation`] before anything is written. When every
    /// worker is busy and the queue is full this waits for room; the job is
    /// already visible as `PENDING` meanwhile.
    pub async fn enqueue(
        &self,
        owner_id: DbId,
        job_type: &str,
        payload: JsonValue,
        associated: AssociatedIds,
    ) -> Result<JobId, QueueError> {
        if self.intake.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let handler = self
            .handlers
            .get(job_type)
            .ok_or_else(|| QueueError::Validation(format!("unknown job type: {job_type}")))?;
        handler
            .validate(&payload)
            .map_err(|e| QueueError::Validation(e.to_string()))?;

        let job = self
            .store
            .create(&NewJob {
                id: uuid::Uuid::now_v7(),
                job_type: job_type.to_string(),
                owner_id,
                exam_id: associated.exam_id,
                lecture_id: associated.lecture_id,
                payload,
            })
            .await?;

        tracing::info!(job_id = %job.id, job_type, owner_id, "Job enqueued");
        self.dispatch(job.id).await;
        Ok(job.id)
    }

    /// Current state of a job.
    pub async fn get_job(&self, id: JobId) -> Result<JobSnapshot, QueueError> {
        if let Some(snapshot) = self.unpersisted_snapshot(id) {
            return Ok(snapshot);
        }
        self.store
            .find_by_id(id)
            .await?
            .map(|job| job.snapshot())
            .ok_or(QueueError::NotFound(id))
    }

    /// Jobs of one owner, newest first.
    pub async fn list_jobs(
        &self,
        owner_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<JobSnapshot>, QueueError> {
        let jobs = self.store.list_by_owner(owner_id, params).await?;
        Ok(jobs
            .iter()
            .map(|job| self.unpersisted_snapshot(job.id).unwrap_or_else(|| job.snapshot()))
            .collect())
    }

    /// Cancel a job.
    ///
    /// A pending job becomes `CANCELLED` immediately; a running job has its
    /// token cancelled and its handler decides the final state. Cancelling a
    /// terminal job is a successful no-op.
    pub async fn cancel_job(&self, id: JobId) -> Result<(), QueueError> {
        let cancelled = match self.store.cancel_pending(id).await {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Cancel write failed, retrying once");
                tokio::time::sleep(TERMINAL_RETRY_DELAY).await;
                self.store.cancel_pending(id).await.map_err(|e| {
                    tracing::error!(job_id = %id, error = %e, "Failed to cancel pending job");
                    QueueError::Internal(format!("failed to cancel job {id}"))
                })?
            }
        };

        if let Some(job) = cancelled {
            tracing::info!(job_id = %id, "Pending job cancelled");
            self.registry.publish(job.snapshot());
            return Ok(());
        }

        let job = self.get_job(id).await?;
        if job.is_terminal() {
            return Ok(());
        }

        let token = self.running_jobs().get(&id).cloned();
        match token {
            Some(token) => {
                tracing::info!(job_id = %id, "Cancelling running job");
                token.cancel();
            }
            None => tracing::warn!(
                job_id = %id,
                status = %job.status,
                "Job is not owned by any worker, nothing to cancel",
            ),
        }
        Ok(())
    }

    /// Subscribe to a job's progress events.
    ///
    /// The stream ends after the terminal event. Subscribing to a job that
    /// already finished yields its terminal state right away.
    pub async fn subscribe(&self, id: JobId) -> Result<JobEventStream, QueueError> {
        let stream = self.registry.subscribe(id);
        match self.get_job(id).await {
            Ok(job) => {
                if job.is_terminal() {
                    self.registry.publish(job);
                }
                Ok(stream)
            }
            Err(e) => {
                self.registry.unsubscribe(id, stream.id());
                Err(e)
            }
        }
    }

    pub fn unsubscribe(&self, stream: JobEventStream) {
        self.registry.unsubscribe(stream.job_id(), stream.id());
    }

    /// Number of jobs currently owned by a worker.
    pub fn running_count(&self) -> usize {
        self.running_jobs().len()
    }

    /// Stop accepting jobs and wait for the pool to drain.
    ///
    /// In-flight jobs get the configured grace period; after that their
    /// tokens are cancelled and the pool is given the same period again.
    pub async fn shutdown(&self) {
        tracing::info!(running = self.running_count(), "Job queue shutting down");
        self.intake.cancel();
        self.tracker.close();

        let grace = self.config.shutdown_timeout;
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                running = self.running_count(),
                "Shutdown grace period elapsed, cancelling running jobs",
            );
            self.abort.cancel();
            if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
                tracing::error!(
                    running = self.running_count(),
                    "Handlers ignored cancellation, abandoning them",
                );
                return;
            }
        }
        tracing::info!("Job queue stopped");
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    async fn dispatch(&self, id: JobId) {
        tokio::select! {
            sent = self.sender.send(id) => {
                if sent.is_err() {
                    tracing::warn!(job_id = %id, "Work queue closed, job stays pending");
                }
            }
            _ = self.intake.cancelled() => {
                tracing::warn!(job_id = %id, "Shutting down before dispatch, job stays pending");
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, receiver: SharedReceiver) {
        tracing::debug!(worker, "Worker started");
        loop {
            let next = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.intake.cancelled() => None,
                    id = receiver.recv() => id,
                }
            };
            let Some(id) = next else { break };
            self.run_job(worker, id).await;
        }
        tracing::debug!(worker, "Worker stopped");
    }

    async fn run_job(&self, worker: usize, id: JobId) {
        // Registered before the status flip so a cancel that observes
        // RUNNING always finds the token.
        let token = self.abort.child_token();
        self.running_jobs().insert(id, token.clone());

        let job = match self.store.mark_running(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %id, "Job no longer pending, skipping");
                self.running_jobs().remove(&id);
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to mark job running");
                self.running_jobs().remove(&id);
                return;
            }
        };

        let started = Instant::now();
        let snapshot = job.snapshot();
        let reporter = ProgressReporter::new(
            snapshot.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            token.clone(),
        );
        self.registry.publish(snapshot.clone());
        tracing::info!(worker, job_id = %id, job_type = %job.job_type, "Job started");

        let outcome = match self.handlers.get(&job.job_type) {
            Some(handler) => self.execute(handler, &job, snapshot, &token, &reporter).await,
            None => JobOutcome::Failed(format!("no handler registered for job type {}", job.job_type)),
        };

        self.finish(id, &reporter, outcome, started).await;
    }

    /// Run the handler on its own task so a panic cannot take the worker
    /// down, then map its return value to an outcome.
    async fn execute(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &Job,
        snapshot: JobSnapshot,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> JobOutcome {
        let ctx = JobContext::new(snapshot, token.clone(), reporter.clone());
        let task = tokio::spawn(async move { handler.run(ctx).await });

        match task.await {
            Ok(Ok(result)) => JobOutcome::Completed(result),
            Ok(Err(e)) if token.is_cancelled() || e == HandlerError::Cancelled => {
                JobOutcome::Cancelled(Some(e.to_string()))
            }
            Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
            Err(e) => {
                tracing::error!(job_id = %job.id, job_type = %job.job_type, error = %e, "Job handler panicked");
                JobOutcome::Failed(PANIC_ERROR.into())
            }
        }
    }

    /// Persist the terminal state (one retry), publish it and release the
    /// job's token.
    async fn finish(&self, id: JobId, reporter: &ProgressReporter, outcome: JobOutcome, started: Instant) {
        let fallback = reporter.close(&outcome).await;

        let persisted = match self.store.finish(id, &outcome).await {
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Terminal write failed, retrying once");
                tokio::time::sleep(TERMINAL_RETRY_DELAY).await;
                self.store.finish(id, &outcome).await
            }
            ok => ok,
        };

        let terminal = match persisted {
            Ok(Some(job)) => job.snapshot(),
            Ok(None) => {
                tracing::warn!(job_id = %id, "Job was already terminal in the store");
                match self.store.find_by_id(id).await {
                    Ok(Some(job)) => job.snapshot(),
                    _ => fallback,
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %id,
                    error = %e,
                    "Failed to persist terminal job state, keeping it in memory",
                );
                self.unpersisted
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, fallback.clone());
                fallback
            }
        };

        let status = terminal.status;
        self.registry.publish(terminal);
        self.running_jobs().remove(&id);

        tracing::info!(
            job_id = %id,
            status = %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished",
        );
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn running_jobs(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unpersisted_snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        self.unpersisted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}
