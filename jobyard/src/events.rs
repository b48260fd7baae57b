use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::JobId;
use crate::recurring::RecurringJobId;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event with metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    /// Wrap a payload, deriving the idempotency key from its content.
    pub fn new(payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(payload.idempotency_key()),
            payload,
        }
    }

    /// Job the event refers to, if any.
    pub fn job_id(&self) -> Option<JobId> {
        self.payload.job_id()
    }
}

/// Event payload emitted for lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum JobEventPayload {
    Enqueued {
        job_id: JobId,
        queue_name: String,
        job_type: String,
        priority: i32,
    },
    Leased {
        job_id: JobId,
        queue_name: String,
        worker_id: String,
        attempt: i32,
    },
    Progress {
        job_id: JobId,
        progress: u8,
    },
    Completed {
        job_id: JobId,
        queue_name: String,
        job_type: String,
        processing_time_ms: i64,
    },
    /// A failed attempt; `will_retry` is false once attempts are exhausted.
    Failed {
        job_id: JobId,
        queue_name: String,
        job_type: String,
        attempts: i32,
        will_retry: bool,
        error: String,
    },
    Cancelled {
        job_id: JobId,
    },
    /// Manual retry requested by a caller.
    Retried {
        job_id: JobId,
        reset_attempts: bool,
    },
    /// Supervisor returned an orphaned job to the queue.
    Reclaimed {
        job_id: JobId,
    },
    WorkerStarted {
        worker_id: String,
    },
    WorkerStopped {
        worker_id: String,
        /// True when the supervisor stopped a silent worker.
        by_supervisor: bool,
    },
    RecurringFired {
        recurring_job_id: RecurringJobId,
        job_id: JobId,
        manual: bool,
    },
}

impl JobEventPayload {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEventPayload::Enqueued { job_id, .. }
            | JobEventPayload::Leased { job_id, .. }
            | JobEventPayload::Progress { job_id, .. }
            | JobEventPayload::Completed { job_id, .. }
            | JobEventPayload::Failed { job_id, .. }
            | JobEventPayload::Cancelled { job_id }
            | JobEventPayload::Retried { job_id, .. }
            | JobEventPayload::Reclaimed { job_id }
            | JobEventPayload::RecurringFired { job_id, .. } => Some(*job_id),
            JobEventPayload::WorkerStarted { .. }
            | JobEventPayload::WorkerStopped { .. } => None,
        }
    }

    fn idempotency_key(&self) -> String {
        match self {
            JobEventPayload::Enqueued { job_id, .. } => {
                format!("enqueue-{job_id}")
            }
            JobEventPayload::Leased {
                job_id, attempt, ..
            } => format!("lease-{job_id}-{attempt}"),
            JobEventPayload::Progress { job_id, progress } => {
                format!("progress-{job_id}-{progress}")
            }
            JobEventPayload::Completed { job_id, .. } => {
                format!("complete-{job_id}")
            }
            JobEventPayload::Failed {
                job_id, attempts, ..
            } => format!("fail-{job_id}-{attempts}"),
            JobEventPayload::Cancelled { job_id } => format!("cancel-{job_id}"),
            JobEventPayload::Retried { job_id, .. } => format!("retry-{job_id}"),
            JobEventPayload::Reclaimed { job_id } => {
                format!("reclaim-{job_id}")
            }
            JobEventPayload::WorkerStarted { worker_id } => {
                format!("worker-start-{worker_id}")
            }
            JobEventPayload::WorkerStopped { worker_id, .. } => {
                format!("worker-stop-{worker_id}")
            }
            JobEventPayload::RecurringFired {
                recurring_job_id,
                job_id,
                ..
            } => format!("recurring-{recurring_job_id}-{job_id}"),
        }
    }
}

/// Sink for lifecycle events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;

    /// Subscribe to events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers; a subscriber that falls
/// more than `capacity` events behind receives `RecvError::Lagged`.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}
