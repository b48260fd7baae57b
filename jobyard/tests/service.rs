//! Service operations: listing, queue policy, stats, metrics, progress,
//! logs and retention cleanup.

use std::sync::Arc;

use chrono::Duration;
use jobyard::*;
use jobyard_testkit::fixtures::{lease, new_job, store_at_epoch};
use jobyard_testkit::{InMemoryJobStore, ManualClock};
use serde_json::json;

fn service() -> (JobService<InMemoryJobStore>, Arc<InMemoryJobStore>, ManualClock) {
    let (store, clock) = store_at_epoch();
    let service = JobService::new(
        Arc::clone(&store),
        Arc::new(InProcEventBus::new(64)),
        Arc::new(clock.clone()),
    );
    (service, store, clock)
}

async fn finish(store: &InMemoryJobStore, queue: &str, worker_id: &str, ok: bool) -> JobId {
    let l = lease(store, queue, worker_id).await.unwrap().unwrap();
    let update = if ok {
        StatusUpdate::Completed {
            worker_id: worker_id.to_string(),
            result: Some(json!({ "ok": true })),
            processing_time_ms: 200,
        }
    } else {
        StatusUpdate::Failed {
            worker_id: worker_id.to_string(),
            failure: JobFailure::new("bad").with_processing_time_ms(100),
        }
    };
    store.update_status(l.job_id(), update).await.unwrap();
    l.job_id()
}

#[tokio::test]
async fn test_list_jobs_filters_and_pages() {
    let (service, _store, clock) = service();
    let tenant = uuid::Uuid::now_v7();
    for i in 0..5 {
        service
            .create_job(Some(tenant), "emails", "send", json!({ "i": i }), JobOptions::default())
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
    }
    service
        .create_job(None, "reports", "build", json!({}), JobOptions::default())
        .await
        .unwrap();

    let filter = JobFilter::default().with_tenant(tenant).with_queue("emails");
    let page = service.list_jobs(&filter, 2, 1).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].payload, json!({ "i": 3 }), "newest first");
    assert_eq!(page[1].payload, json!({ "i": 2 }));

    let all = service.list_jobs(&JobFilter::default(), 100, 0).await.unwrap();
    assert_eq!(all.len(), 6);

    assert!(service.list_jobs(&filter, 0, 0).await.is_err());
    assert!(service.list_jobs(&filter, 10, -1).await.is_err());
}

#[tokio::test]
async fn test_create_job_validates_input() {
    let (service, store, _clock) = service();
    let err = service
        .create_job(None, "", "send", json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));

    let err = service
        .create_job(None, "default", "send", json!({}), JobOptions::default().with_max_retries(0))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
    assert_eq!(store.job_count(), 0);
}

#[tokio::test]
async fn test_out_of_range_delay_is_a_validation_error() {
    let (service, store, _clock) = service();
    let err = service
        .create_job(
            None,
            "default",
            "send",
            json!({}),
            JobOptions::default().with_delay_ms(u64::MAX),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
    assert_eq!(store.job_count(), 0);
}

#[tokio::test]
async fn test_retry_delay_is_bounded() {
    let (service, store, clock) = service();
    let err = service
        .configure_queue(QueueConfig::new("slowpoke").with_retry_delay_seconds(i64::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));

    service
        .configure_queue(
            QueueConfig::new("slowpoke").with_retry_delay_seconds(MAX_RETRY_DELAY_SECONDS),
        )
        .await
        .unwrap();
    store.enqueue(new_job("slowpoke", "a")).await.unwrap();
    let id = finish(&store, "slowpoke", "w1", false).await;

    let job = store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.next_retry_at,
        Some(clock.now() + Duration::seconds(MAX_RETRY_DELAY_SECONDS))
    );
}

#[tokio::test]
async fn test_queue_policy_roundtrip_and_validation() {
    let (service, _store, _clock) = service();
    let stored = service
        .configure_queue(
            QueueConfig::new("media")
                .with_concurrency_limit(4)
                .with_max_retries(5)
                .with_timeout_seconds(900),
        )
        .await
        .unwrap();
    assert_eq!(stored.concurrency_limit, 4);

    let paused = service.pause_queue("media").await.unwrap();
    assert!(paused.is_paused);
    assert_eq!(paused.max_retries, 5, "pause keeps other settings");

    let err = service
        .configure_queue(QueueConfig::new("bad").with_max_retries(0))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));

    let names: Vec<String> = service
        .list_queues()
        .await
        .unwrap()
        .into_iter()
        .map(|q| q.name)
        .collect();
    assert_eq!(names, vec!["media".to_string()]);
}

#[tokio::test]
async fn test_queue_stats_count_every_status() {
    let (service, store, clock) = service();
    for _ in 0..4 {
        store.enqueue(new_job("default", "a")).await.unwrap();
    }
    store
        .enqueue(new_job("default", "later").with_options(JobOptions::default().with_delay_ms(60_000)))
        .await
        .unwrap();
    clock.advance(Duration::seconds(2));

    finish(&store, "default", "w1", true).await;
    finish(&store, "default", "w1", false).await;
    lease(&*store, "default", "w1").await.unwrap().unwrap();

    let stats = service.get_queue_stats("default").await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retry_pending, 1);
    assert_eq!(stats.total(), 5);
    assert_eq!(stats.wait_time.samples, 3);
    assert_eq!(stats.wait_time.max_ms, Some(2_000));
    assert_eq!(stats.processing_time.avg_ms, Some(200.0));

    let all = service.get_all_queue_stats().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_queue_metrics_bucket_by_hour() {
    let (service, store, clock) = service();
    let since = clock.now();
    store.enqueue(new_job("default", "a")).await.unwrap();
    store.enqueue(new_job("default", "b")).await.unwrap();
    finish(&store, "default", "w1", true).await;

    clock.advance(Duration::hours(1));
    finish(&store, "default", "w1", false).await;

    let buckets = service
        .get_queue_metrics("default", BucketSize::Hour, since)
        .await
        .unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].bucket_start, since);
    assert_eq!(buckets[0].enqueued, 2);
    assert_eq!(buckets[0].completed, 1);
    assert_eq!(buckets[1].failed, 1);
    assert_eq!(buckets[1].wait_time.samples, 1);
}

#[tokio::test]
async fn test_cleanup_removes_only_old_terminal_jobs() {
    let (service, store, clock) = service();
    store
        .upsert_queue(QueueConfig::new("default").with_retry_delay_seconds(40 * 86_400))
        .await
        .unwrap();
    store.enqueue(new_job("default", "a")).await.unwrap();
    store.enqueue(new_job("default", "b")).await.unwrap();

    let done = finish(&store, "default", "w1", true).await;
    store.append_log(done, LogLevel::Info, "finished", None).await.unwrap();
    let retrying = finish(&store, "default", "w1", false).await;
    let cancelled = service
        .create_job(None, "default", "c", json!({}), JobOptions::default())
        .await
        .unwrap();
    service.cancel_job(cancelled).await.unwrap();

    clock.advance(Duration::days(31));
    store.enqueue(new_job("default", "d")).await.unwrap();
    let fresh = finish(&store, "default", "w1", true).await;

    let report = service.cleanup_old_jobs(30).await.unwrap();
    assert_eq!(report, CleanupReport { jobs_deleted: 2, logs_deleted: 1 });

    assert!(store.get(done).await.unwrap_err().is_not_found());
    assert!(store.get(cancelled).await.is_err());
    assert!(store.get(retrying).await.is_ok(), "retry-pending jobs are kept");
    assert!(store.get(fresh).await.is_ok());
    assert!(store.logs(done).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cleanup_with_huge_retention_deletes_nothing() {
    let (service, store, clock) = service();
    store.enqueue(new_job("default", "a")).await.unwrap();
    let done = finish(&store, "default", "w1", true).await;
    clock.advance(Duration::days(365));

    let report = service.cleanup_old_jobs(u32::MAX).await.unwrap();
    assert_eq!(report, CleanupReport::default());
    assert!(store.get(done).await.is_ok());
}

#[tokio::test]
async fn test_cleanup_keeps_unmet_dependencies_of_live_jobs() {
    let (service, store, clock) = service();
    let parent = service
        .create_job(None, "default", "parent", json!({}), JobOptions::default().with_max_retries(1))
        .await
        .unwrap();
    let child = service
        .create_job(None, "default", "child", json!({}), JobOptions::default().depends_on(parent))
        .await
        .unwrap();
    assert_eq!(finish(&store, "default", "w1", false).await, parent);
    assert!(lease(&*store, "default", "w1").await.unwrap().is_none());

    clock.advance(Duration::days(31));
    let report = service.cleanup_old_jobs(30).await.unwrap();
    assert_eq!(report.jobs_deleted, 0);
    assert!(store.get(parent).await.is_ok());
    assert_eq!(service.get_dependencies(child).await.unwrap(), vec![parent]);
    assert!(
        lease(&*store, "default", "w1").await.unwrap().is_none(),
        "child stays blocked on a dependency that never completed"
    );

    // Once the dependent is itself terminal and old, both go.
    service.cancel_job(child).await.unwrap();
    clock.advance(Duration::days(31));
    let report = service.cleanup_old_jobs(30).await.unwrap();
    assert_eq!(report.jobs_deleted, 2);
}

#[tokio::test]
async fn test_progress_and_logs_from_handler_context() {
    let (store, _clock) = store_at_epoch();
    let bus = Arc::new(InProcEventBus::new(64));
    let mut rx = bus.subscribe();
    let id = store.enqueue(new_job("default", "a")).await.unwrap();
    let l = lease(&*store, "default", "w1").await.unwrap().unwrap();

    let ctx = ExecutionContext::new(
        &l,
        std::time::Duration::from_secs(30),
        store.clone(),
        bus.clone(),
    );
    ctx.update_progress(150, Some(json!({ "step": "upload" }))).await.unwrap();
    ctx.log(LogLevel::Warn, "slow upstream", Some(json!({ "ms": 900 }))).await.unwrap();

    let job = store.get(id).await.unwrap();
    assert_eq!(job.progress, 100);
    assert_eq!(job.progress_data, Some(json!({ "step": "upload" })));

    let logs = store.logs(id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Warn);
    assert_eq!(logs[0].message, "slow upstream");

    let event = rx.recv().await.unwrap();
    assert_eq!(event.payload, JobEventPayload::Progress { job_id: id, progress: 100 });

    let err = store.update_progress(id, "w2", 10, None).await.unwrap_err();
    assert!(matches!(err, JobError::LeaseNotHeld { .. }));
}

#[tokio::test]
async fn test_service_dependency_api() {
    let (service, store, _clock) = service();
    let a = store.enqueue(new_job("default", "a")).await.unwrap();
    let b = store.enqueue(new_job("default", "b")).await.unwrap();

    service.add_dependency(b, a).await.unwrap();
    service.add_dependency(b, a).await.unwrap();
    assert_eq!(service.get_dependencies(b).await.unwrap(), vec![a]);

    assert!(service.add_dependency(a, a).await.is_err());
    let err = service.add_dependency(a, JobId::new()).await.unwrap_err();
    assert!(err.is_not_found());
}
