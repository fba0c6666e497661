//! Handlers for the `/jobs` resource.
//!
//! All endpoints require authentication via [`AuthUser`]. Users only ever
//! see their own jobs; another user's job is reported as not found.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use lectern_core::error::CoreError;
use lectern_core::types::{DbId, JobId};
use lectern_db::models::job::{AssociatedIds, JobListQuery, JobSnapshot};
use serde::Deserialize;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobRequest {
    #[validate(length(min = 1, max = 64))]
    pub job_type: String,
    /// Handler configuration, checked by the handler before persistence.
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[validate(range(min = 1))]
    pub exam_id: Option<DbId>,
    #[validate(range(min = 1))]
    pub lecture_id: Option<DbId>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fetch a job and verify the caller owns it.
async fn find_owned(state: &AppState, job_id: JobId, auth: &AuthUser) -> AppResult<JobSnapshot> {
    let job = state.queue.get_job(job_id).await?;
    if job.owner_id != auth.user_id {
        return Err(AppError::Core(CoreError::NotFound {
            entity: "Job",
            id: job_id.to_string(),
        }));
    }
    Ok(job)
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Returns 201 with the job in `PENDING` (or already further along).
/// Unknown types and payloads the handler rejects are a 400.
pub async fn submit_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(input): Json<SubmitJobRequest>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;

    let job_id = state
        .queue
        .enqueue(
            auth.user_id,
            &input.job_type,
            input.payload,
            AssociatedIds {
                exam_id: input.exam_id,
                lecture_id: input.lecture_id,
            },
        )
        .await?;
    let job = state.queue.get_job(job_id).await?;

    tracing::info!(
        job_id = %job_id,
        job_type = %job.job_type,
        user_id = auth.user_id,
        "Job submitted",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// The caller's jobs, newest first. Supports `status`, `limit` and `offset`.
pub async fn list_jobs(
    auth: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.queue.list_jobs(auth.user_id, &params).await?;
    Ok(Json(DataResponse { data: jobs }))
}

// ---------------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = find_owned(&state, job_id, &auth).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Returns 204. Cancelling a finished job succeeds without changing it.
pub async fn cancel_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<StatusCode> {
    find_owned(&state, job_id, &auth).await?;
    state.queue.cancel_job(job_id).await?;

    tracing::info!(job_id = %job_id, user_id = auth.user_id, "Job cancel requested");
    Ok(StatusCode::NO_CONTENT)
}
