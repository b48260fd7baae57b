use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::queue::QueueConfig;
use crate::recurring::RecurringJobId;
use crate::retry::{FailureOutcome, RetryPolicy};

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Delayed,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Delayed,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Delayed => "delayed",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses a job can never leave.
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Delayed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::validation(format!("unknown job status: {s}")))
    }
}

/// A persisted unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: Option<Uuid>,
    pub queue_name: String,
    pub job_type: String,
    /// Higher runs first.
    pub priority: i32,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub progress_data: Option<Value>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub timeout_seconds: Option<i32>,
    pub idempotency_key: Option<String>,
    pub recurring_job_id: Option<RecurringJobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A failed job still waiting for its automatic retry.
    pub fn is_retry_pending(&self) -> bool {
        self.status == JobStatus::Failed
            && self.next_retry_at.is_some()
            && self.attempts < self.max_attempts
    }

    /// Completed, cancelled, or failed with no retry scheduled.
    pub fn is_terminal(&self) -> bool {
        self.status.is_final()
            || (self.status == JobStatus::Failed && !self.is_retry_pending())
    }

    /// Time the job waited between creation and its lease.
    pub fn wait_time(&self) -> Option<Duration> {
        self.started_at.map(|started| started - self.created_at)
    }

    /// Take the lease on behalf of `worker_id`.
    pub fn mark_leased(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.locked_by = Some(worker_id.to_string());
        self.locked_at = Some(now);
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Return an orphaned `processing` job to the queue.
    pub fn reclaim(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.locked_by = None;
        self.locked_at = None;
        self.started_at = None;
        self.updated_at = now;
    }

    /// Apply a typed status change, enforcing lifecycle rules.
    ///
    /// On error the job is left untouched.
    pub fn apply_update(
        &mut self,
        update: &StatusUpdate,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match update {
            StatusUpdate::Completed {
                worker_id,
                result,
                processing_time_ms,
            } => {
                self.ensure_lease_holder(worker_id, JobStatus::Completed)?;
                self.status = JobStatus::Completed;
                self.result = result.clone();
                self.processing_time_ms = Some(*processing_time_ms);
                self.progress = 100;
                self.completed_at = Some(now);
                self.next_retry_at = None;
                self.clear_lease();
            }
            StatusUpdate::Failed { worker_id, failure } => {
                self.ensure_lease_holder(worker_id, JobStatus::Failed)?;
                let outcome =
                    policy.on_failure(self.attempts, self.max_attempts, now)?;
                self.attempts = outcome.attempts();
                self.next_retry_at = match outcome {
                    FailureOutcome::Retry { next_retry_at, .. } => {
                        Some(next_retry_at)
                    }
                    FailureOutcome::Exhausted { .. } => None,
                };
                self.status = JobStatus::Failed;
                self.error_message = Some(failure.message.clone());
                self.error_stack = failure.stack.clone();
                self.processing_time_ms = failure.processing_time_ms;
                self.failed_at = Some(now);
                self.clear_lease();
            }
            StatusUpdate::Cancelled => {
                if !self.status.is_cancellable() {
                    return Err(self.invalid(JobStatus::Cancelled));
                }
                self.status = JobStatus::Cancelled;
            }
            StatusUpdate::Requeued { reset_attempts } => {
                if self.status != JobStatus::Failed {
                    return Err(self.invalid(JobStatus::Queued));
                }
                if !reset_attempts && self.attempts >= self.max_attempts {
                    return Err(JobError::AttemptsExhausted {
                        job_id: self.id,
                        attempts: self.attempts,
                        max_attempts: self.max_attempts,
                    });
                }
                if *reset_attempts {
                    self.attempts = 0;
                }
                self.status = JobStatus::Queued;
                self.next_retry_at = None;
                self.error_message = None;
                self.error_stack = None;
                self.failed_at = None;
                self.started_at = None;
                self.progress = 0;
                self.progress_data = None;
            }
        }
        self.updated_at = now;
        Ok(())
    }

    fn ensure_lease_holder(
        &self,
        worker_id: &str,
        target: JobStatus,
    ) -> Result<()> {
        if self.status != JobStatus::Processing {
            return Err(self.invalid(target));
        }
        if self.locked_by.as_deref() != Some(worker_id) {
            return Err(JobError::LeaseNotHeld {
                job_id: self.id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    fn clear_lease(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }

    fn invalid(&self, to: JobStatus) -> JobError {
        JobError::InvalidTransition {
            job_id: self.id,
            from: self.status,
            to,
        }
    }
}

/// Status changes a caller may request.
///
/// `processing` is deliberately absent: it is only reachable by leasing.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusUpdate {
    Completed {
        worker_id: String,
        result: Option<Value>,
        processing_time_ms: i64,
    },
    Failed {
        worker_id: String,
        failure: JobFailure,
    },
    Cancelled,
    /// Manual retry of a failed job.
    Requeued { reset_attempts: bool },
}

impl StatusUpdate {
    pub fn target(&self) -> JobStatus {
        match self {
            StatusUpdate::Completed { .. } => JobStatus::Completed,
            StatusUpdate::Failed { .. } => JobStatus::Failed,
            StatusUpdate::Cancelled => JobStatus::Cancelled,
            StatusUpdate::Requeued { .. } => JobStatus::Queued,
        }
    }
}

/// Error details recorded on a failed attempt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub stack: Option<String>,
    pub processing_time_ms: Option<i64>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Record how long the failed attempt ran.
    pub fn with_processing_time_ms(mut self, ms: i64) -> Self {
        self.processing_time_ms = Some(ms);
        self
    }
}

/// Optional knobs for job creation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub delay_ms: Option<u64>,
    /// Overrides the queue's `max_retries` as the job's `max_attempts`.
    pub max_retries: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub idempotency_key: Option<String>,
    pub depends_on: Vec<JobId>,
}

impl JobOptions {
    /// Set the priority; higher values lease first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the job until `at`.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Hold the job for `delay_ms` after enqueue.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Override the queue's attempt ceiling.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the queue's advisory timeout.
    pub fn with_timeout_seconds(mut self, seconds: i32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Deduplicate creation on `(tenant, key)`.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Gate leasing on `job_id` completing.
    pub fn depends_on(mut self, job_id: JobId) -> Self {
        self.depends_on.push(job_id);
        self
    }
}

/// An enqueue request before it has been materialized into a [`Job`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant_id: Option<Uuid>,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Value,
    pub options: JobOptions,
    pub recurring_job_id: Option<RecurringJobId>,
}

impl NewJob {
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id: None,
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            options: JobOptions::default(),
            recurring_job_id: None,
        }
    }

    /// Set the owning tenant.
    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Replace the enqueue options.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the priority; higher values lease first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.options.priority = priority;
        self
    }

    /// Build the stored record, resolving defaults from the queue policy.
    pub fn into_job(
        self,
        queue: &QueueConfig,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        if self.queue_name.trim().is_empty() {
            return Err(JobError::validation("queue name must not be empty"));
        }
        if self.job_type.trim().is_empty() {
            return Err(JobError::validation("job type must not be empty"));
        }
        let max_attempts =
            self.options.max_retries.unwrap_or(queue.max_retries);
        if max_attempts < 1 {
            return Err(JobError::validation(format!(
                "max attempts must be at least 1, got {max_attempts}"
            )));
        }
        if let Some(timeout) = self.options.timeout_seconds {
            if timeout < 1 {
                return Err(JobError::validation(
                    "timeout seconds must be positive",
                ));
            }
        }
        if self.options.depends_on.iter().any(|dep| dep.0.is_nil()) {
            return Err(JobError::validation("dependency id must not be nil"));
        }

        let delayed_until = match self.options.delay_ms.filter(|ms| *ms > 0) {
            Some(ms) => Some(
                i64::try_from(ms)
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| {
                        JobError::validation(format!(
                            "delay of {ms}ms is out of range"
                        ))
                    })?,
            ),
            None => None,
        };
        let scheduled_for = match (self.options.scheduled_for, delayed_until) {
            (Some(at), Some(until)) => Some(at.max(until)),
            (at, until) => at.or(until),
        };
        let status = match scheduled_for {
            Some(at) if at > now => JobStatus::Delayed,
            _ => JobStatus::Queued,
        };

        Ok(Job {
            id: JobId::new(),
            tenant_id: self.tenant_id,
            queue_name: self.queue_name,
            job_type: self.job_type,
            priority: self.options.priority,
            payload: self.payload,
            status,
            attempts: 0,
            max_attempts,
            scheduled_for,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
            progress: 0,
            progress_data: None,
            result: None,
            error_message: None,
            error_stack: None,
            processing_time_ms: None,
            timeout_seconds: self.options.timeout_seconds,
            idempotency_key: self.options.idempotency_key,
            recurring_job_id: self.recurring_job_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
        })
    }
}

/// Filters for listing jobs. Unset fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub tenant_id: Option<Uuid>,
    pub queue_name: Option<String>,
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

impl JobFilter {
    /// Only jobs of this tenant.
    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Only jobs in this queue.
    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Only jobs in this status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only jobs of this type.
    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.tenant_id.map_or(true, |t| job.tenant_id == Some(t))
            && self
                .queue_name
                .as_deref()
                .map_or(true, |q| job.queue_name == q)
            && self.status.map_or(true, |s| job.status == s)
            && self
                .job_type
                .as_deref()
                .map_or(true, |t| job.job_type == t)
    }
}

/// Severity of a job log entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => {
                Err(JobError::validation(format!("unknown log level: {other}")))
            }
        }
    }
}

/// A log line a handler attached to its job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}
