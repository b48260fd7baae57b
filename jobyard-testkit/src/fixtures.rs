use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jobyard::{
    JobLease, JobStore, LeaseRequest, NewJob, Result, WorkerConfig,
    WorkerRegistration,
};
use serde_json::json;

use crate::{InMemoryJobStore, ManualClock};

/// Fixed instant tests start from.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Store and clock sharing [`epoch`] as "now".
pub fn store_at_epoch() -> (Arc<InMemoryJobStore>, ManualClock) {
    let clock = ManualClock::new(epoch());
    let store = InMemoryJobStore::with_clock(Arc::new(clock.clone()));
    (Arc::new(store), clock)
}

pub fn new_job(queue: &str, job_type: &str) -> NewJob {
    NewJob::new(queue, job_type, json!({ "queue": queue }))
}

pub fn registration(worker_id: &str, queues: &[&str]) -> WorkerRegistration {
    WorkerRegistration {
        worker_id: worker_id.to_string(),
        hostname: "testhost".to_string(),
        pid: std::process::id(),
        queues: queues.iter().map(|q| q.to_string()).collect(),
    }
}

/// Worker settings with millisecond intervals.
pub fn fast_worker_config(queues: &[&str]) -> WorkerConfig {
    WorkerConfig::new(queues.iter().copied())
        .with_poll_interval(5)
        .with_heartbeat_interval(20)
        .with_error_backoff(5)
        .with_hostname("testhost")
}

pub async fn lease(
    store: &impl JobStore,
    queue: &str,
    worker_id: &str,
) -> Result<Option<JobLease>> {
    store.lease_next(&LeaseRequest::new(queue, worker_id)).await
}
