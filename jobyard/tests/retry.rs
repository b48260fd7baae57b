//! Failure handling: delayed retries, exhaustion and manual retry.

use std::sync::Arc;

use chrono::Duration;
use jobyard::*;
use jobyard_testkit::fixtures::{fast_worker_config, lease, new_job, store_at_epoch};
use jobyard_testkit::{FailingHandler, FlakyHandler, MockDispatcher};

fn fail(worker_id: &str, message: &str) -> StatusUpdate {
    StatusUpdate::Failed {
        worker_id: worker_id.to_string(),
        failure: JobFailure::new(message),
    }
}

fn bus() -> Arc<dyn JobEventPublisher> {
    Arc::new(InProcEventBus::new(64))
}

#[tokio::test]
async fn test_failures_retry_after_delay_until_exhausted() {
    let (store, clock) = store_at_epoch();
    store
        .upsert_queue(
            QueueConfig::new("default")
                .with_retry_delay_seconds(30)
                .with_max_retries(3),
        )
        .await
        .unwrap();
    let id = store.enqueue(new_job("default", "flaky")).await.unwrap();

    for attempt in 1..=2 {
        let l = lease(&*store, "default", "w1").await.unwrap().unwrap();
        assert_eq!(l.attempt(), attempt);

        let job = store.update_status(id, fail("w1", "boom")).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, attempt);
        assert_eq!(job.next_retry_at, Some(clock.now() + Duration::seconds(30)));
        assert!(job.is_retry_pending());
        assert!(job.locked_by.is_none());

        assert!(
            lease(&*store, "default", "w1").await.unwrap().is_none(),
            "retry waits for its delay"
        );
        clock.advance(Duration::seconds(30));
    }

    lease(&*store, "default", "w1").await.unwrap().unwrap();
    let job = store.update_status(id, fail("w1", "final")).await.unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.next_retry_at, None);
    assert!(job.is_terminal());
    assert_eq!(job.error_message.as_deref(), Some("final"));

    clock.advance(Duration::hours(1));
    assert!(lease(&*store, "default", "w1").await.unwrap().is_none());

    let stats = store.queue_stats("default").await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retry_pending, 0);
}

#[tokio::test]
async fn test_per_job_max_retries_overrides_queue() {
    let (store, _clock) = store_at_epoch();
    let id = store
        .enqueue(
            new_job("default", "once")
                .with_options(JobOptions::default().with_max_retries(1)),
        )
        .await
        .unwrap();

    lease(&*store, "default", "w1").await.unwrap().unwrap();
    let job = store.update_status(id, fail("w1", "nope")).await.unwrap();
    assert!(job.is_terminal());
}

#[tokio::test]
async fn test_manual_retry_of_exhausted_job() {
    let (store, clock) = store_at_epoch();
    let service = JobService::new(Arc::clone(&store), bus(), Arc::new(clock));
    let id = service
        .create_job(
            None,
            "default",
            "once",
            serde_json::json!({}),
            JobOptions::default().with_max_retries(1),
        )
        .await
        .unwrap();
    lease(&*store, "default", "w1").await.unwrap().unwrap();
    store.update_status(id, fail("w1", "nope")).await.unwrap();

    let err = service.retry_job(id, false).await.unwrap_err();
    assert!(matches!(err, JobError::AttemptsExhausted { attempts: 1, .. }));

    let job = service.retry_job(id, true).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 0);
    assert!(job.error_message.is_none());
    assert!(lease(&*store, "default", "w1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_manual_retry_skips_pending_delay() {
    let (store, clock) = store_at_epoch();
    let service = JobService::new(Arc::clone(&store), bus(), Arc::new(clock));
    let id = store.enqueue(new_job("default", "flaky")).await.unwrap();
    lease(&*store, "default", "w1").await.unwrap().unwrap();
    store.update_status(id, fail("w1", "boom")).await.unwrap();

    let job = service.retry_job(id, false).await.unwrap();
    assert_eq!(job.attempts, 1, "attempts kept without reset");
    assert!(job.next_retry_at.is_none());
    assert!(lease(&*store, "default", "w1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_retry_of_non_failed_job_is_rejected() {
    let (store, clock) = store_at_epoch();
    let service = JobService::new(Arc::clone(&store), bus(), Arc::new(clock));
    let id = store.enqueue(new_job("default", "a")).await.unwrap();

    let err = service.retry_job(id, true).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_worker_succeeds_after_two_failures() {
    let (store, clock) = store_at_epoch();
    let handler = FlakyHandler::new(2);
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", handler.clone());

    let worker = WorkerLoop::new(
        "w1",
        fast_worker_config(&["default"]),
        Arc::clone(&store),
        Arc::new(registry),
        bus(),
    );
    store.register_worker(worker.registration()).await.unwrap();
    let id = store.enqueue(new_job("default", "flaky")).await.unwrap();

    assert!(worker.poll_once().await.unwrap());
    assert_eq!(store.get(id).await.unwrap().error_message.as_deref(), Some("transient failure 1"));
    assert!(!worker.poll_once().await.unwrap(), "retry not yet due");

    clock.advance(Duration::seconds(DEFAULT_RETRY_DELAY_SECONDS));
    assert!(worker.poll_once().await.unwrap());
    clock.advance(Duration::seconds(DEFAULT_RETRY_DELAY_SECONDS));
    assert!(worker.poll_once().await.unwrap());

    let job = store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.progress, 100);
    assert_eq!(job.result, Some(serde_json::json!({ "succeeded_on_call": 3 })));
    assert_eq!(handler.call_count(), 3);
}

#[tokio::test]
async fn test_handler_error_stack_is_stored() {
    let (store, _clock) = store_at_epoch();
    let mut registry = HandlerRegistry::new();
    registry.register("broken", FailingHandler::new("disk full"));
    let worker = WorkerLoop::new(
        "w1",
        fast_worker_config(&["default"]),
        Arc::clone(&store),
        Arc::new(registry),
        bus(),
    );
    store.register_worker(worker.registration()).await.unwrap();
    let id = store.enqueue(new_job("default", "broken")).await.unwrap();

    assert!(worker.poll_once().await.unwrap());

    let job = store.get(id).await.unwrap();
    assert_eq!(job.error_message.as_deref(), Some("disk full"));
    assert_eq!(job.error_stack.as_deref(), Some("at FailingHandler::handle"));
    assert!(job.processing_time_ms.is_some());
}

#[tokio::test]
async fn test_worker_reports_attempt_to_dispatcher() {
    let (store, clock) = store_at_epoch();
    let dispatcher = Arc::new(MockDispatcher::with_result(DispatchStatus::Failure {
        error: HandlerError::new("always"),
    }));
    let worker = WorkerLoop::new(
        "w1",
        fast_worker_config(&["default"]),
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        bus(),
    );
    store.register_worker(worker.registration()).await.unwrap();
    store.enqueue(new_job("default", "x")).await.unwrap();

    worker.poll_once().await.unwrap();
    clock.advance(Duration::seconds(DEFAULT_RETRY_DELAY_SECONDS));
    worker.poll_once().await.unwrap();

    let attempts: Vec<i32> = dispatcher.records().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    dispatcher.assert_dispatch_count_eq(2);
}
