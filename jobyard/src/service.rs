//! Programmatic surface for producers and operators.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{JobError, Result};
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{
    Job, JobFilter, JobId, JobLogEntry, JobOptions, NewJob, StatusUpdate,
};
use crate::queue::QueueConfig;
use crate::recurring::{NewRecurringJob, RecurringJob, RecurringJobId};
use crate::scheduler::RecurringScheduler;
use crate::stats::{BucketSize, CleanupReport, MetricsBucket, QueueStats};
use crate::store::Store;
use crate::telemetry;
use crate::workers::{WorkerRecord, WorkerStatus};

/// Upper bound on `list_jobs` page size.
pub const MAX_LIST_LIMIT: i64 = 1_000;

pub struct JobService<S> {
    store: Arc<S>,
    events: Arc<dyn JobEventPublisher>,
    scheduler: RecurringScheduler<S>,
}

impl<S> Clone for JobService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S> std::fmt::Debug for JobService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("store_type", &std::any::type_name::<S>())
            .finish()
    }
}

impl<S: Store> JobService<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn JobEventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = RecurringScheduler::new(
            Arc::clone(&store),
            Arc::clone(&events),
            clock,
            SchedulerConfig::default(),
        );
        Self {
            store,
            events,
            scheduler,
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub async fn create_job(
        &self,
        tenant_id: Option<Uuid>,
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId> {
        let mut new_job =
            NewJob::new(queue_name, job_type, payload).with_options(options);
        new_job.tenant_id = tenant_id;
        self.enqueue(new_job).await
    }

    /// Enqueue a prepared [`NewJob`].
    pub async fn enqueue(&self, new_job: NewJob) -> Result<JobId> {
        let queue_name = new_job.queue_name.clone();
        let job_type = new_job.job_type.clone();
        let priority = new_job.options.priority;

        let job_id = self
            .store
            .enqueue(new_job)
            .instrument(telemetry::job_enqueue_span(&queue_name, &job_type))
            .await?;

        telemetry::record_job_enqueued(&queue_name, &job_type);
        self.publish(JobEventPayload::Enqueued {
            job_id,
            queue_name,
            job_type,
            priority,
        })
        .await;
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.store.get(job_id).await
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        if limit < 1 {
            return Err(JobError::validation("limit must be positive"));
        }
        if offset < 0 {
            return Err(JobError::validation("offset must not be negative"));
        }
        self.store
            .list(filter, limit.min(MAX_LIST_LIMIT), offset)
            .await
    }

    /// Requeue a failed job. Without `reset_attempts` this fails once the
    /// job has used all its attempts.
    pub async fn retry_job(
        &self,
        job_id: JobId,
        reset_attempts: bool,
    ) -> Result<Job> {
        let job = self
            .store
            .update_status(job_id, StatusUpdate::Requeued { reset_attempts })
            .await?;
        tracing::info!(job_id = %job_id, reset_attempts, "job retried");
        self.publish(JobEventPayload::Retried {
            job_id,
            reset_attempts,
        })
        .await;
        Ok(job)
    }

    /// Cancel a job that is still `queued` or `delayed`.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        let job = self
            .store
            .update_status(job_id, StatusUpdate::Cancelled)
            .await?;
        tracing::info!(job_id = %job_id, "job cancelled");
        self.publish(JobEventPayload::Cancelled { job_id }).await;
        Ok(job)
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats> {
        self.store.queue_stats(queue_name).await
    }

    pub async fn get_all_queue_stats(&self) -> Result<Vec<QueueStats>> {
        self.store.all_queue_stats().await
    }

    pub async fn get_queue_metrics(
        &self,
        queue_name: &str,
        bucket: BucketSize,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricsBucket>> {
        self.store.queue_metrics(queue_name, bucket, since).await
    }

    pub async fn create_scheduled_job(
        &self,
        definition: NewRecurringJob,
    ) -> Result<RecurringJob> {
        let created = self.store.create_recurring(definition).await?;
        tracing::info!(
            name = %created.name,
            id = %created.id,
            "recurring job created"
        );
        Ok(created)
    }

    pub async fn list_scheduled_jobs(&self) -> Result<Vec<RecurringJob>> {
        self.store.list_recurring().await
    }

    pub async fn delete_scheduled_job(&self, id: RecurringJobId) -> Result<()> {
        self.store.delete_recurring(id).await
    }

    /// Enqueue one instance of a recurring job immediately.
    pub async fn trigger_scheduled_job(
        &self,
        id: RecurringJobId,
    ) -> Result<JobId> {
        self.scheduler.trigger(id).await
    }

    /// Delete terminal jobs older than `retention_days` and their logs.
    pub async fn cleanup_old_jobs(
        &self,
        retention_days: u32,
    ) -> Result<CleanupReport> {
        let report = self
            .store
            .cleanup(Duration::days(i64::from(retention_days)))
            .await?;
        tracing::info!(
            jobs_deleted = report.jobs_deleted,
            logs_deleted = report.logs_deleted,
            retention_days,
            "old jobs cleaned up"
        );
        Ok(report)
    }

    pub async fn configure_queue(
        &self,
        config: QueueConfig,
    ) -> Result<QueueConfig> {
        config.validate()?;
        self.store.upsert_queue(config).await
    }

    pub async fn pause_queue(&self, queue_name: &str) -> Result<QueueConfig> {
        self.set_paused(queue_name, true).await
    }

    pub async fn resume_queue(&self, queue_name: &str) -> Result<QueueConfig> {
        self.set_paused(queue_name, false).await
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueConfig>> {
        self.store.list_queues().await
    }

    /// Make `job_id` wait until `depends_on` completes.
    pub async fn add_dependency(
        &self,
        job_id: JobId,
        depends_on: JobId,
    ) -> Result<()> {
        if job_id == depends_on {
            return Err(JobError::validation("a job cannot depend on itself"));
        }
        self.store.add_dependency(job_id, depends_on).await
    }

    pub async fn get_dependencies(&self, job_id: JobId) -> Result<Vec<JobId>> {
        self.store.dependencies(job_id).await
    }

    pub async fn get_job_logs(&self, job_id: JobId) -> Result<Vec<JobLogEntry>> {
        self.store.logs(job_id).await
    }

    pub async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<WorkerRecord>> {
        self.store.list_workers(status).await
    }

    async fn set_paused(
        &self,
        queue_name: &str,
        paused: bool,
    ) -> Result<QueueConfig> {
        let config = self.store.queue_config(queue_name).await?.paused(paused);
        let config = self.store.upsert_queue(config).await?;
        tracing::info!(queue = %queue_name, paused, "queue pause state changed");
        Ok(config)
    }

    async fn publish(&self, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(payload)).await {
            tracing::warn!("publish event failed: {err}");
        }
    }
}
