use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};
use crate::job::JobId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "stopped" => Ok(WorkerStatus::Stopped),
            other => Err(JobError::validation(format!(
                "unknown worker status: {other}"
            ))),
        }
    }
}

/// Identity a worker loop announces when it starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    pub pid: u32,
    pub queues: Vec<String>,
}

/// Persisted row for a running (or previously running) worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub hostname: String,
    pub pid: u32,
    pub queues: Vec<String>,
    pub status: WorkerStatus,
    pub current_job_id: Option<JobId>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn register(
        registration: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: registration.worker_id,
            hostname: registration.hostname,
            pid: registration.pid,
            queues: registration.queues,
            status: WorkerStatus::Active,
            current_job_id: None,
            last_heartbeat: now,
            started_at: now,
            stopped_at: None,
        }
    }

    /// A heartbeat from a worker the supervisor gave up on reactivates it.
    pub fn heartbeat(&mut self, current_job_id: Option<JobId>, now: DateTime<Utc>) {
        self.status = WorkerStatus::Active;
        self.stopped_at = None;
        self.current_job_id = current_job_id;
        self.last_heartbeat = now;
    }

    /// Idempotent: a stopped worker keeps its original `stopped_at`.
    pub fn stop(&mut self, now: DateTime<Utc>) {
        if self.status == WorkerStatus::Stopped {
            return;
        }
        self.status = WorkerStatus::Stopped;
        self.current_job_id = None;
        self.stopped_at = Some(now);
    }

    pub fn is_silent_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == WorkerStatus::Active && self.last_heartbeat < cutoff
    }
}
