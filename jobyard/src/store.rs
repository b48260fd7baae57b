//! Storage contracts shared by every backend.
//!
//! A backend implements all three traits; the runtime, the supervisor and
//! the service layer only ever talk to storage through them. Every
//! cross-process guarantee (single lease per job, compare-and-set on
//! recurring firings) must hold at the storage layer.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::job::{
    Job, JobFilter, JobId, JobLogEntry, LogLevel, NewJob, StatusUpdate,
};
use crate::lease::{JobLease, LeaseRequest};
use crate::queue::QueueConfig;
use crate::recurring::{NewRecurringJob, RecurringJob, RecurringJobId};
use crate::stats::{BucketSize, CleanupReport, MetricsBucket, QueueStats};
use crate::workers::{WorkerRecord, WorkerRegistration, WorkerStatus};

/// Durable job records, queue policies, logs and dependencies.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job and return its id.
    ///
    /// With an idempotency key, an existing job with the same tenant and key
    /// is returned instead of inserting a duplicate.
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Fetch a job or fail with `JobNotFound`.
    async fn get(&self, job_id: JobId) -> Result<Job>;

    /// List jobs newest first.
    async fn list(
        &self,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>>;

    /// Atomically lease the best eligible job of one queue.
    ///
    /// `Ok(None)` means nothing is eligible, the queue is paused, or its
    /// concurrency limit is reached.
    async fn lease_next(&self, request: &LeaseRequest)
        -> Result<Option<JobLease>>;

    /// Apply a typed status change.
    async fn update_status(
        &self,
        job_id: JobId,
        update: StatusUpdate,
    ) -> Result<Job>;

    /// Record handler progress on a job leased by `worker_id`.
    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: u8,
        data: Option<Value>,
    ) -> Result<()>;

    async fn append_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: &str,
        details: Option<Value>,
    ) -> Result<()>;

    /// Log entries oldest first.
    async fn logs(&self, job_id: JobId) -> Result<Vec<JobLogEntry>>;

    /// Make `job_id` wait for `depends_on` to complete.
    async fn add_dependency(
        &self,
        job_id: JobId,
        depends_on: JobId,
    ) -> Result<()>;

    async fn dependencies(&self, job_id: JobId) -> Result<Vec<JobId>>;

    /// Move `delayed` jobs whose start time has passed to `queued`.
    async fn promote_delayed(&self) -> Result<u64>;

    /// Reset `processing` jobs leased more than `stuck_after` ago.
    async fn reclaim_stuck(&self, stuck_after: Duration) -> Result<Vec<JobId>>;

    /// Create or replace a queue policy.
    async fn upsert_queue(&self, config: QueueConfig) -> Result<QueueConfig>;

    /// Stored policy, or defaults for a queue that was never configured.
    async fn queue_config(&self, name: &str) -> Result<QueueConfig>;

    async fn list_queues(&self) -> Result<Vec<QueueConfig>>;

    async fn queue_stats(&self, name: &str) -> Result<QueueStats>;

    /// Stats for every queue that has jobs or a stored policy.
    async fn all_queue_stats(&self) -> Result<Vec<QueueStats>>;

    async fn queue_metrics(
        &self,
        name: &str,
        bucket: BucketSize,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricsBucket>>;

    /// Delete terminal jobs older than `retention` and their logs.
    async fn cleanup(&self, retention: Duration) -> Result<CleanupReport>;
}

/// Worker rows and heartbeats.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerRecord>;

    async fn heartbeat(
        &self,
        worker_id: &str,
        current_job_id: Option<JobId>,
    ) -> Result<()>;

    /// Mark a worker stopped. Idempotent.
    async fn stop_worker(&self, worker_id: &str) -> Result<()>;

    /// Stop active workers silent for longer than `silence`; returns their
    /// ids.
    async fn stop_silent_workers(&self, silence: Duration)
        -> Result<Vec<String>>;

    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<WorkerRecord>>;
}

/// Recurring job definitions.
#[async_trait]
pub trait RecurringJobStore: Send + Sync {
    /// Fails with `Conflict` when the name is taken.
    async fn create_recurring(
        &self,
        definition: NewRecurringJob,
    ) -> Result<RecurringJob>;

    async fn get_recurring(&self, id: RecurringJobId) -> Result<RecurringJob>;

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>>;

    async fn delete_recurring(&self, id: RecurringJobId) -> Result<()>;

    /// Set `last_run_at = run_at` only if it still equals `expected`.
    ///
    /// Returns false when another scheduler claimed the firing first.
    async fn claim_recurring_run(
        &self,
        id: RecurringJobId,
        expected: Option<DateTime<Utc>>,
        run_at: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Everything the runtime needs from a backend.
pub trait Store: JobStore + WorkerRegistry + RecurringJobStore + 'static {}

impl<T> Store for T where T: JobStore + WorkerRegistry + RecurringJobStore + 'static
{}
