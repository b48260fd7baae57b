use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

pub const DEFAULT_RETRY_DELAY_SECONDS: i64 = 60;
/// Upper bound on `retry_delay_seconds`: one year.
pub const MAX_RETRY_DELAY_SECONDS: i64 = 365 * 24 * 60 * 60;
pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 300;

/// Policy for a named lane of jobs.
///
/// Queues without a stored row behave as `QueueConfig::new(name)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name jobs reference.
    pub name: String,
    /// Maximum jobs in `processing` at once; 0 means unlimited.
    pub concurrency_limit: i32,
    /// Delay before a failed job becomes eligible again.
    pub retry_delay_seconds: i64,
    /// Default `max_attempts` for jobs that do not override it.
    pub max_retries: i32,
    /// Advisory execution budget for handlers.
    pub timeout_seconds: i32,
    /// No new leases while true.
    pub is_paused: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency_limit: 0,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            is_paused: false,
        }
    }

    /// Cap concurrent `processing` jobs; 0 removes the cap.
    pub fn with_concurrency_limit(mut self, limit: i32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Set the delay before a failed job is retried.
    pub fn with_retry_delay_seconds(mut self, seconds: i64) -> Self {
        self.retry_delay_seconds = seconds;
        self
    }

    /// Set the default attempt ceiling for new jobs.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the advisory handler timeout.
    pub fn with_timeout_seconds(mut self, seconds: i32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Pause or resume leasing.
    pub fn paused(mut self, paused: bool) -> Self {
        self.is_paused = paused;
        self
    }

    /// True when `processing` jobs already fill the concurrency limit.
    pub fn is_saturated(&self, processing: usize) -> bool {
        self.concurrency_limit > 0
            && processing >= self.concurrency_limit as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(JobError::validation("queue name must not be empty"));
        }
        if self.concurrency_limit < 0 {
            return Err(JobError::validation(
                "concurrency limit must not be negative",
            ));
        }
        if self.retry_delay_seconds < 0 {
            return Err(JobError::validation(
                "retry delay must not be negative",
            ));
        }
        if self.retry_delay_seconds > MAX_RETRY_DELAY_SECONDS {
            return Err(JobError::validation(format!(
                "retry delay must be at most {MAX_RETRY_DELAY_SECONDS} seconds"
            )));
        }
        if self.max_retries < 1 {
            return Err(JobError::validation("max retries must be at least 1"));
        }
        if self.timeout_seconds < 1 {
            return Err(JobError::validation("timeout must be positive"));
        }
        Ok(())
    }
}
