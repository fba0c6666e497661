//! Concurrent fan-out behaviour of the progress registry.

use std::sync::Arc;

use chrono::Utc;
use lectern_core::types::JobId;
use lectern_db::models::job::{JobMetrics, JobSnapshot};
use lectern_db::models::status::JobStatus;
use lectern_events::ProgressRegistry;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn snapshot(id: JobId, status: JobStatus, progress: i16) -> JobSnapshot {
    JobSnapshot {
        id,
        job_type: "transcription".into(),
        status,
        owner_id: 7,
        exam_id: None,
        lecture_id: Some(2),
        payload: serde_json::json!({}),
        progress,
        progress_message: String::new(),
        result: None,
        error: None,
        metrics: JobMetrics::new(),
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        completed_at: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_subscribers_see_same_order() {
    let registry = Arc::new(ProgressRegistry::new(128));
    let id = uuid::Uuid::new_v4();

    let mut readers = Vec::new();
    for _ in 0..2 {
        let mut stream = registry.subscribe(id);
        readers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = stream.recv().await {
                seen.push((event.status, event.progress));
            }
            seen
        }));
    }

    let publisher = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for progress in 0..=99 {
                registry.publish(snapshot(id, JobStatus::Running, progress));
                tokio::task::yield_now().await;
            }
            registry.publish(snapshot(id, JobStatus::Completed, 100));
        })
    };
    publisher.await.unwrap();

    let first = readers.remove(0).await.unwrap();
    let second = readers.remove(0).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 101);
    assert_eq!(first.last(), Some(&(JobStatus::Completed, 100)));
    let terminals = first.iter().filter(|(s, _)| s.is_terminal()).count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn subscribe_racing_terminal_yields_exactly_one_terminal() {
    let registry = Arc::new(ProgressRegistry::default());

    for _ in 0..50 {
        let id = uuid::Uuid::new_v4();
        let subscriber = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let mut stream = registry.subscribe(id);
                let mut terminals = 0;
                while let Some(event) = stream.recv().await {
                    if event.is_terminal() {
                        terminals += 1;
                    }
                }
                terminals
            })
        };
        registry.publish(snapshot(id, JobStatus::Failed, 40));
        registry.publish(snapshot(id, JobStatus::Failed, 40));

        assert_eq!(subscriber.await.unwrap(), 1);
    }
}

#[tokio::test]
async fn abandoned_subscriber_does_not_block_publisher() {
    let registry = ProgressRegistry::new(4);
    let id = uuid::Uuid::new_v4();
    let _never_read = registry.subscribe(id);

    for progress in 0..1000 {
        registry.publish(snapshot(id, JobStatus::Running, (progress % 100) as i16));
    }
    registry.publish(snapshot(id, JobStatus::Completed, 100));

    assert_eq!(registry.subscriber_count(id), 0);
    assert!(registry.is_finished(id));
}
