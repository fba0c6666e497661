use lectern_core::error::CoreError;
use lectern_core::types::JobId;

/// Errors returned synchronously by [`JobQueue`](crate::JobQueue) operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Unknown job type or malformed payload. Nothing was persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Job store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Job queue is shutting down")]
    ShuttingDown,
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(msg) => CoreError::Validation(msg),
            QueueError::NotFound(id) => CoreError::NotFound {
                entity: "Job",
                id: id.to_string(),
            },
            QueueError::Internal(msg) => CoreError::Internal(msg),
            QueueError::Store(e) => CoreError::Internal(format!("Job store error: {e}")),
            QueueError::ShuttingDown => CoreError::Conflict("Job queue is shutting down".into()),
        }
    }
}

/// Failure surfaced by a job handler.
///
/// The `Display` text is stored verbatim as the job's `error` column.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// The handler observed cancellation and stopped.
    #[error("job cancelled")]
    Cancelled,

    /// The payload does not match the handler's configuration shape.
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn queue_errors_map_to_core_errors() {
        let id = uuid::Uuid::new_v4();
        assert_matches!(
            CoreError::from(QueueError::NotFound(id)),
            CoreError::NotFound { entity: "Job", id: ref s } if *s == id.to_string()
        );
        assert_matches!(
            CoreError::from(QueueError::Validation("unknown job type: x".into())),
            CoreError::Validation(_)
        );
        assert_matches!(
            CoreError::from(QueueError::Store(sqlx::Error::PoolTimedOut)),
            CoreError::Internal(_)
        );
    }

    #[test]
    fn handler_error_text_is_verbatim() {
        assert_eq!(HandlerError::failed("ocr engine unavailable").to_string(), "ocr engine unavailable");
        assert_eq!(HandlerError::Cancelled.to_string(), "job cancelled");
    }
}
