//! Job handlers and their registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use lectern_core::types::JobId;
use lectern_db::models::job::{JobMetrics, JobSnapshot};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::reporter::ProgressReporter;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Context provided to a handler for one run.
pub struct JobContext {
    job: JobSnapshot,
    cancel: CancellationToken,
    reporter: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(job: JobSnapshot, cancel: CancellationToken, reporter: ProgressReporter) -> Self {
        Self {
            job,
            cancel,
            reporter,
        }
    }

    /// The job as it was when it started running.
    pub fn job(&self) -> &JobSnapshot {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Token cancelled when the job is cancelled or the queue shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub async fn report_progress(&self, percent: u8, message: impl Into<String>) {
        self.reporter.report_progress(percent, message).await
    }

    pub async fn report_metrics(&self, partial: &JobMetrics) {
        self.reporter.report_metrics(partial).await
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Executes jobs of one type.
///
/// Handlers must observe [`JobContext::cancelled`] promptly; the scheduler
/// never aborts a running handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Check a payload before the job is persisted.
    fn validate(&self, _payload: &JsonValue) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Run the job to completion and return its result.
    async fn run(&self, ctx: JobContext) -> Result<JsonValue, HandlerError>;
}

/// A handler whose payload has a typed shape.
///
/// Register it wrapped in [`Typed`]; the payload is decoded into
/// [`Config`](Self::Config) once at enqueue time for validation and again
/// before each run.
#[async_trait]
pub trait TypedJobHandler: Send + Sync + 'static {
    type Config: DeserializeOwned + Send + 'static;

    async fn run(&self, config: Self::Config, ctx: JobContext) -> Result<JsonValue, HandlerError>;
}

/// Adapts a [`TypedJobHandler`] to [`JobHandler`].
pub struct Typed<H>(pub H);

fn decode<C: DeserializeOwned>(payload: &JsonValue) -> Result<C, HandlerError> {
    serde_json::from_value(payload.clone()).map_err(|e| HandlerError::InvalidConfig(e.to_string()))
}

#[async_trait]
impl<H: TypedJobHandler> JobHandler for Typed<H> {
    fn validate(&self, payload: &JsonValue) -> Result<(), HandlerError> {
        decode::<H::Config>(payload).map(|_| ())
    }

    async fn run(&self, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        let config = decode::<H::Config>(ctx.payload())?;
        self.0.run(config, ctx).await
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        (self.0)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Maps a job-type tag to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        tracing::debug!(job_type = %job_type, "Registered job handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type, Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(self, job_type: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.get(job_type).is_some()
    }

    /// Registered type tags, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
