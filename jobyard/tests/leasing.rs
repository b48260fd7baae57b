//! Leasing behavior against the in-memory store: exclusivity, ordering,
//! delays, pause, concurrency limits, dependencies and idempotency.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use jobyard::*;
use jobyard_testkit::fixtures::{lease, new_job, store_at_epoch};
use jobyard_testkit::InMemoryJobStore;

fn complete(worker_id: &str) -> StatusUpdate {
    StatusUpdate::Completed {
        worker_id: worker_id.to_string(),
        result: None,
        processing_time_ms: 5,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_lease_each_job_once() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut expected = HashSet::new();
    for _ in 0..50 {
        expected.insert(store.enqueue(new_job("default", "noop")).await.unwrap());
    }

    let mut tasks = Vec::new();
    for w in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut leased = Vec::new();
            while let Some(l) = lease(&*store, "default", &worker_id).await.unwrap() {
                assert_eq!(l.job.locked_by.as_deref(), Some(worker_id.as_str()));
                leased.push(l.job_id());
            }
            leased
        }));
    }

    let mut seen = Vec::new();
    for task in tasks {
        seen.extend(task.await.unwrap());
    }
    let unique: HashSet<JobId> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 50, "every job leased exactly once");
    assert_eq!(unique, expected);
}

#[tokio::test]
async fn test_higher_priority_first_then_oldest() {
    let (store, clock) = store_at_epoch();
    let a = store.enqueue(new_job("default", "a")).await.unwrap();
    clock.advance(Duration::seconds(1));
    let b = store.enqueue(new_job("default", "b")).await.unwrap();
    clock.advance(Duration::seconds(1));
    let c = store
        .enqueue(new_job("default", "c").with_priority(5))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(l) = lease(&*store, "default", "w1").await.unwrap() {
        order.push(l.job_id());
    }
    assert_eq!(order, vec![c, a, b]);
}

#[tokio::test]
async fn test_lease_marks_job_processing() {
    let (store, clock) = store_at_epoch();
    let id = store.enqueue(new_job("default", "noop")).await.unwrap();
    clock.advance(Duration::seconds(3));

    let l = lease(&*store, "default", "w1").await.unwrap().unwrap();
    assert_eq!(l.attempt(), 1);
    assert_eq!(l.wait_time(), Duration::seconds(3));

    let job = store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.locked_at, Some(clock.now()));
    assert_eq!(job.started_at, Some(clock.now()));
}

#[tokio::test]
async fn test_other_queues_are_not_leased() {
    let (store, _clock) = store_at_epoch();
    store.enqueue(new_job("emails", "send")).await.unwrap();

    assert!(lease(&*store, "reports", "w1").await.unwrap().is_none());
    assert!(lease(&*store, "emails", "w1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_delayed_job_waits_for_its_start_time() {
    let (store, clock) = store_at_epoch();
    let id = store
        .enqueue(
            new_job("default", "later")
                .with_options(JobOptions::default().with_delay_ms(60_000)),
        )
        .await
        .unwrap();
    assert_eq!(store.get(id).await.unwrap().status, JobStatus::Delayed);

    assert!(lease(&*store, "default", "w1").await.unwrap().is_none());

    clock.advance(Duration::seconds(61));
    let l = lease(&*store, "default", "w1").await.unwrap();
    assert_eq!(l.map(|l| l.job_id()), Some(id));
}

#[tokio::test]
async fn test_scheduled_for_in_the_past_is_queued() {
    let (store, clock) = store_at_epoch();
    let id = store
        .enqueue(new_job("default", "now").with_options(
            JobOptions::default().with_scheduled_for(clock.now() - Duration::minutes(5)),
        ))
        .await
        .unwrap();
    assert_eq!(store.get(id).await.unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn test_paused_queue_yields_nothing_until_resumed() {
    let (store, clock) = store_at_epoch();
    let events: Arc<dyn JobEventPublisher> = Arc::new(InProcEventBus::new(16));
    let service = JobService::new(Arc::clone(&store), events, Arc::new(clock));

    service
        .create_job(None, "default", "noop", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();
    service.pause_queue("default").await.unwrap();
    assert!(lease(&*store, "default", "w1").await.unwrap().is_none());

    service.resume_queue("default").await.unwrap();
    assert!(lease(&*store, "default", "w1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrency_limit_caps_processing_jobs() {
    let (store, _clock) = store_at_epoch();
    store
        .upsert_queue(QueueConfig::new("limited").with_concurrency_limit(1))
        .await
        .unwrap();
    store.enqueue(new_job("limited", "a")).await.unwrap();
    store.enqueue(new_job("limited", "b")).await.unwrap();

    let first = lease(&*store, "limited", "w1").await.unwrap().unwrap();
    assert!(lease(&*store, "limited", "w2").await.unwrap().is_none());

    store
        .update_status(first.job_id(), complete("w1"))
        .await
        .unwrap();
    assert!(lease(&*store, "limited", "w2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_dependent_job_waits_for_completion() {
    let (store, _clock) = store_at_epoch();
    let parent = store.enqueue(new_job("default", "parent")).await.unwrap();
    let child = store
        .enqueue(
            new_job("default", "child").with_options(
                JobOptions::default().with_priority(10).depends_on(parent),
            ),
        )
        .await
        .unwrap();
    assert_eq!(store.dependencies(child).await.unwrap(), vec![parent]);

    let first = lease(&*store, "default", "w1").await.unwrap().unwrap();
    assert_eq!(first.job_id(), parent, "child is blocked despite priority");
    assert!(lease(&*store, "default", "w1").await.unwrap().is_none());

    store.update_status(parent, complete("w1")).await.unwrap();
    let next = lease(&*store, "default", "w1").await.unwrap().unwrap();
    assert_eq!(next.job_id(), child);
}

#[tokio::test]
async fn test_dependency_cycles_are_rejected() {
    let (store, _clock) = store_at_epoch();
    let a = store.enqueue(new_job("default", "a")).await.unwrap();
    let b = store.enqueue(new_job("default", "b")).await.unwrap();
    let c = store.enqueue(new_job("default", "c")).await.unwrap();

    store.add_dependency(b, a).await.unwrap();
    store.add_dependency(c, b).await.unwrap();

    let err = store.add_dependency(a, c).await.unwrap_err();
    assert!(matches!(err, JobError::Validation(_)), "got {err:?}");
    let err = store.add_dependency(a, a).await.unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
}

#[tokio::test]
async fn test_dependency_on_unknown_job_fails() {
    let (store, _clock) = store_at_epoch();
    let missing = JobId::new();
    let err = store
        .enqueue(new_job("default", "child").with_options(JobOptions::default().depends_on(missing)))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::JobNotFound(id) if id == missing));
    assert_eq!(store.job_count(), 0);
}

#[tokio::test]
async fn test_idempotency_key_returns_existing_job() {
    let (store, _clock) = store_at_epoch();
    let options = JobOptions::default().with_idempotency_key("invoice-42");

    let first = store
        .enqueue(new_job("default", "bill").with_options(options.clone()))
        .await
        .unwrap();
    let second = store
        .enqueue(new_job("default", "bill").with_options(options.clone()))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(store.job_count(), 1);

    let tenant = uuid::Uuid::now_v7();
    let other_tenant = store
        .enqueue(new_job("default", "bill").with_tenant(tenant).with_options(options))
        .await
        .unwrap();
    assert_ne!(first, other_tenant, "keys are scoped per tenant");
}

#[tokio::test]
async fn test_cancel_only_before_lease() {
    let (store, clock) = store_at_epoch();
    let events: Arc<dyn JobEventPublisher> = Arc::new(InProcEventBus::new(16));
    let service = JobService::new(Arc::clone(&store), events, Arc::new(clock));

    let queued = service
        .create_job(None, "default", "a", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();
    let cancelled = service.cancel_job(queued).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(lease(&*store, "default", "w1").await.unwrap().is_none());

    let running = service
        .create_job(None, "default", "b", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();
    lease(&*store, "default", "w1").await.unwrap().unwrap();
    let err = service.cancel_job(running).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::InvalidTransition { from: JobStatus::Processing, to: JobStatus::Cancelled, .. }
    ));

    let err = service.cancel_job(queued).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_cancel_boundary_across_statuses() {
    let (store, clock) = store_at_epoch();
    let events: Arc<dyn JobEventPublisher> = Arc::new(InProcEventBus::new(16));
    let service = JobService::new(Arc::clone(&store), events, Arc::new(clock));

    let delayed = service
        .create_job(
            None,
            "default",
            "later",
            serde_json::json!({}),
            JobOptions::default().with_delay_ms(60_000),
        )
        .await
        .unwrap();
    assert_eq!(store.get(delayed).await.unwrap().status, JobStatus::Delayed);
    let cancelled = service.cancel_job(delayed).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let done = service
        .create_job(None, "done", "a", serde_json::json!({}), JobOptions::default())
        .await
        .unwrap();
    lease(&*store, "done", "w1").await.unwrap().unwrap();
    store.update_status(done, complete("w1")).await.unwrap();
    let before = store.get(done).await.unwrap();
    let err = service.cancel_job(done).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::InvalidTransition { from: JobStatus::Completed, to: JobStatus::Cancelled, .. }
    ));
    assert_eq!(store.get(done).await.unwrap(), before);

    let broken = service
        .create_job(
            None,
            "broken",
            "a",
            serde_json::json!({}),
            JobOptions::default().with_max_retries(1),
        )
        .await
        .unwrap();
    lease(&*store, "broken", "w1").await.unwrap().unwrap();
    store
        .update_status(
            broken,
            StatusUpdate::Failed {
                worker_id: "w1".to_string(),
                failure: JobFailure::new("boom"),
            },
        )
        .await
        .unwrap();
    let before = store.get(broken).await.unwrap();
    assert_eq!(before.status, JobStatus::Failed);
    let err = service.cancel_job(broken).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::InvalidTransition { from: JobStatus::Failed, to: JobStatus::Cancelled, .. }
    ));
    assert_eq!(store.get(broken).await.unwrap(), before);
}

#[tokio::test]
async fn test_completion_by_other_worker_is_rejected() {
    let (store, _clock) = store_at_epoch();
    let id = store.enqueue(new_job("default", "a")).await.unwrap();
    lease(&*store, "default", "w1").await.unwrap().unwrap();

    let err = store.update_status(id, complete("w2")).await.unwrap_err();
    assert!(matches!(err, JobError::LeaseNotHeld { .. }));
    assert_eq!(store.get(id).await.unwrap().status, JobStatus::Processing);
}
