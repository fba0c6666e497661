//! Integration tests for the `jobs` repository.
//!
//! These run against a real database provisioned by `sqlx::test` and are
//! skipped unless `DATABASE_URL` points at a Postgres server:
//!
//! ```text
//! cargo test -p lectern-db -- --ignored
//! ```

use assert_matches::assert_matches;
use sqlx::PgPool;
use lectern_db::models::job::{JobListQuery, JobMetrics, JobOutcome, NewJob};
use lectern_db::models::status::JobStatus;
use lectern_db::repositories::JobRepo;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_job(owner_id: i64, job_type: &str) -> NewJob {
    NewJob {
        id: uuid::Uuid::now_v7(),
        job_type: job_type.to_string(),
        owner_id,
        exam_id: Some(3),
        lecture_id: None,
        payload: serde_json::json!({"source": "upload-17"}),
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_status_seed_matches_enum(pool: PgPool) {
    let rows: Vec<(i16, String)> =
        sqlx::query_as("SELECT id, name FROM job_statuses ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();

    assert_eq!(rows.len(), 5);
    for (id, name) in rows {
        let status = JobStatus::from_id(id).unwrap();
        assert_eq!(status.as_str(), name);
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_create_and_complete(pool: PgPool) {
    let job = JobRepo::create(&pool, &new_job(1, "transcription"))
        .await
        .unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.exam_id, Some(3));

    let running = JobRepo::mark_running(&pool, job.id).await.unwrap().unwrap();
    assert!(running.started_at.is_some());

    assert!(JobRepo::update_progress(&pool, job.id, 60, "decoding")
        .await
        .unwrap());
    assert!(JobRepo::update_progress(&pool, job.id, 30, "stale")
        .await
        .unwrap());

    let metrics = JobMetrics::new().with("tokens", 1200.0);
    assert!(JobRepo::update_metrics(&pool, job.id, &metrics).await.unwrap());

    let row = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(row.progress, 60);
    assert_eq!(row.metrics(), metrics);

    let done = JobRepo::finish(
        &pool,
        job.id,
        &JobOutcome::Completed(serde_json::json!({"words": 5400})),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.status(), JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.completed_at.is_some());
    assert_eq!(done.result, Some(serde_json::json!({"words": 5400})));
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_terminal_status_is_immutable(pool: PgPool) {
    let job = JobRepo::create(&pool, &new_job(1, "grading")).await.unwrap();
    JobRepo::mark_running(&pool, job.id).await.unwrap();
    JobRepo::finish(&pool, job.id, &JobOutcome::Failed("model timeout".into()))
        .await
        .unwrap()
        .unwrap();

    assert_matches!(
        JobRepo::finish(&pool, job.id, &JobOutcome::Completed(serde_json::json!({}))).await,
        Ok(None)
    );
    assert!(!JobRepo::update_progress(&pool, job.id, 90, "late")
        .await
        .unwrap());

    let row = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(row.status(), JobStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("model timeout"));
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_cancel_pending_races_mark_running(pool: PgPool) {
    let job = JobRepo::create(&pool, &new_job(1, "grading")).await.unwrap();

    let cancelled = JobRepo::cancel_pending(&pool, job.id).await.unwrap();
    assert_matches!(cancelled, Some(ref row) if row.status() == JobStatus::Cancelled);

    assert_matches!(JobRepo::mark_running(&pool, job.id).await, Ok(None));
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_list_unfinished_and_by_owner(pool: PgPool) {
    let a = JobRepo::create(&pool, &new_job(1, "a")).await.unwrap();
    let b = JobRepo::create(&pool, &new_job(1, "b")).await.unwrap();
    let c = JobRepo::create(&pool, &new_job(2, "c")).await.unwrap();
    JobRepo::mark_running(&pool, b.id).await.unwrap();
    JobRepo::cancel_pending(&pool, c.id).await.unwrap();

    let unfinished: Vec<_> = JobRepo::list_unfinished(&pool)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(unfinished, vec![a.id, b.id]);

    let owned = JobRepo::list_by_owner(&pool, 1, &JobListQuery::default())
        .await
        .unwrap();
    assert_eq!(owned.len(), 2);
    assert_eq!(owned[0].id, b.id, "newest first");

    let running_only = JobListQuery {
        status: Some(JobStatus::Running),
        ..Default::default()
    };
    let owned = JobRepo::list_by_owner(&pool, 1, &running_only).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, b.id);
}
