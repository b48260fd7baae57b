//! PostgreSQL store tests.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with: `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use jobyard::persistence::PostgresJobStore;
use jobyard::*;
use serde_json::json;
use uuid::Uuid;

async fn store() -> PostgresJobStore {
    let config = PersistenceConfig::from_env().expect("DATABASE_URL must be set");
    let store = PostgresJobStore::connect(&config).await.unwrap();
    store.migrate().await.unwrap();
    store
}

/// Queue names unique per test run so tests do not see each other's jobs.
fn queue(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7())
}

#[tokio::test]
#[ignore]
async fn test_lease_complete_roundtrip() {
    let store = store().await;
    let q = queue("roundtrip");
    let id = store
        .enqueue(NewJob::new(&q, "send", json!({ "to": "a@example.com" })))
        .await
        .unwrap();

    let lease = store
        .lease_next(&LeaseRequest::new(&q, "pg-w1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.job_id(), id);
    assert_eq!(lease.job.status, JobStatus::Processing);
    assert!(store.lease_next(&LeaseRequest::new(&q, "pg-w2")).await.unwrap().is_none());

    let job = store
        .update_status(
            id,
            StatusUpdate::Completed {
                worker_id: "pg-w1".to_string(),
                result: Some(json!({ "sent": true })),
                processing_time_ms: 12,
            },
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(store.get(id).await.unwrap().result, Some(json!({ "sent": true })));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_leases_are_exclusive() {
    let store = Arc::new(store().await);
    let q = queue("skip-locked");
    for _ in 0..40 {
        store.enqueue(NewJob::new(&q, "noop", json!({}))).await.unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..8 {
        let store = Arc::clone(&store);
        let q = q.clone();
        tasks.push(tokio::spawn(async move {
            let worker = format!("pg-w{w}");
            let mut ids = Vec::new();
            while let Some(lease) = store.lease_next(&LeaseRequest::new(&q, &worker)).await.unwrap() {
                ids.push(lease.job_id());
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<JobId> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test]
#[ignore]
async fn test_failed_attempt_schedules_retry() {
    let store = store().await;
    let q = queue("retry");
    store
        .upsert_queue(QueueConfig::new(&q).with_retry_delay_seconds(3600).with_max_retries(2))
        .await
        .unwrap();
    let id = store.enqueue(NewJob::new(&q, "flaky", json!({}))).await.unwrap();
    store.lease_next(&LeaseRequest::new(&q, "pg-w1")).await.unwrap().unwrap();

    let job = store
        .update_status(
            id,
            StatusUpdate::Failed {
                worker_id: "pg-w1".to_string(),
                failure: JobFailure::new("boom").with_stack("trace"),
            },
        )
        .await
        .unwrap();
    assert!(job.is_retry_pending());
    assert_eq!(job.max_attempts, 2);
    assert!(store.lease_next(&LeaseRequest::new(&q, "pg-w1")).await.unwrap().is_none());

    let stats = store.queue_stats(&q).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retry_pending, 1);
}

#[tokio::test]
#[ignore]
async fn test_idempotent_enqueue_and_dependencies() {
    let store = store().await;
    let q = queue("deps");
    let key = format!("key-{}", Uuid::now_v7());
    let options = JobOptions::default().with_idempotency_key(&key);

    let parent = store
        .enqueue(NewJob::new(&q, "parent", json!({})).with_options(options.clone()))
        .await
        .unwrap();
    let again = store
        .enqueue(NewJob::new(&q, "parent", json!({})).with_options(options))
        .await
        .unwrap();
    assert_eq!(parent, again);

    let child = store
        .enqueue(
            NewJob::new(&q, "child", json!({}))
                .with_options(JobOptions::default().with_priority(10).depends_on(parent)),
        )
        .await
        .unwrap();
    assert_eq!(store.dependencies(child).await.unwrap(), vec![parent]);
    assert!(store.add_dependency(parent, child).await.is_err(), "cycle");

    let first = store.lease_next(&LeaseRequest::new(&q, "pg-w1")).await.unwrap().unwrap();
    assert_eq!(first.job_id(), parent);
}

#[tokio::test]
#[ignore]
async fn test_recurring_claim_is_compare_and_set() {
    let store = store().await;
    let def = store
        .create_recurring(NewRecurringJob::interval(
            format!("pg-recurring-{}", Uuid::now_v7()),
            "default",
            "tick",
            60,
        ))
        .await
        .unwrap();
    let now = chrono::Utc::now();

    assert!(store.claim_recurring_run(def.id, None, now).await.unwrap());
    assert!(!store.claim_recurring_run(def.id, None, now).await.unwrap());
    assert!(store
        .claim_recurring_run(def.id, Some(now), now + Duration::seconds(60))
        .await
        .unwrap());

    let dup = store
        .create_recurring(NewRecurringJob::interval(def.name.clone(), "default", "tick", 60))
        .await
        .unwrap_err();
    assert!(matches!(dup, JobError::Conflict(_)));

    store.delete_recurring(def.id).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_worker_registry_lifecycle() {
    let store = store().await;
    let worker_id = format!("pg-worker-{}", Uuid::now_v7());
    store
        .register_worker(WorkerRegistration {
            worker_id: worker_id.clone(),
            hostname: "pg-host".to_string(),
            pid: 42,
            queues: vec!["default".to_string()],
        })
        .await
        .unwrap();

    store.heartbeat(&worker_id, None).await.unwrap();
    store.stop_worker(&worker_id).await.unwrap();
    store.stop_worker(&worker_id).await.unwrap();

    let stopped = store.list_workers(Some(WorkerStatus::Stopped)).await.unwrap();
    let record = stopped.iter().find(|w| w.id == worker_id).unwrap();
    assert_eq!(record.queues, vec!["default".to_string()]);
    assert!(store.heartbeat("pg-missing", None).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore]
async fn test_cleanup_keeps_unmet_dependencies() {
    let live = store().await;
    let clock = jobyard_testkit::ManualClock::new(
        "2000-01-01T00:00:00Z".parse().unwrap(),
    );
    let past = live.clone().with_clock(Arc::new(clock));
    let q = queue("cleanup-deps");

    let parent = past
        .enqueue(
            NewJob::new(&q, "parent", json!({}))
                .with_options(JobOptions::default().with_max_retries(1)),
        )
        .await
        .unwrap();
    let child = past
        .enqueue(
            NewJob::new(&q, "child", json!({}))
                .with_options(JobOptions::default().depends_on(parent)),
        )
        .await
        .unwrap();
    past.lease_next(&LeaseRequest::new(&q, "pg-w1")).await.unwrap().unwrap();
    past.update_status(
        parent,
        StatusUpdate::Failed {
            worker_id: "pg-w1".to_string(),
            failure: JobFailure::new("boom"),
        },
    )
    .await
    .unwrap();

    live.cleanup(Duration::days(30)).await.unwrap();
    assert!(live.get(parent).await.is_ok());
    assert_eq!(live.dependencies(child).await.unwrap(), vec![parent]);
    assert!(live.lease_next(&LeaseRequest::new(&q, "pg-w1")).await.unwrap().is_none());

    live.cleanup(Duration::days(u32::MAX as i64)).await.unwrap();
}
