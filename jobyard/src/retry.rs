//! Retry and backoff decisions for failed attempts.
//!
//! Backoff is flat: every retry of a job waits the queue's configured
//! `retry_delay_seconds`, regardless of how many attempts came before.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};
use crate::queue::{
    QueueConfig, DEFAULT_RETRY_DELAY_SECONDS, MAX_RETRY_DELAY_SECONDS,
};

/// What happens to a job after a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureOutcome {
    /// The job becomes eligible again at `next_retry_at`.
    Retry {
        attempts: i32,
        next_retry_at: DateTime<Utc>,
    },
    /// No attempts left; the job is permanently failed.
    Exhausted { attempts: i32 },
}

impl FailureOutcome {
    pub fn attempts(&self) -> i32 {
        match self {
            FailureOutcome::Retry { attempts, .. }
            | FailureOutcome::Exhausted { attempts } => *attempts,
        }
    }

    pub fn will_retry(&self) -> bool {
        matches!(self, FailureOutcome::Retry { .. })
    }
}

/// Flat backoff policy derived from a queue's configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_RETRY_DELAY_SECONDS))
    }
}

impl RetryPolicy {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            retry_delay: retry_delay.max(Duration::zero()),
        }
    }

    /// Policy for `queue`. A stored delay outside the accepted range is
    /// clamped into it.
    pub fn for_queue(queue: &QueueConfig) -> Self {
        let seconds = queue
            .retry_delay_seconds
            .clamp(0, MAX_RETRY_DELAY_SECONDS);
        Self::new(Duration::try_seconds(seconds).unwrap_or_else(Duration::zero))
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Decide the next state after a failure with `attempts_before`
    /// attempts already recorded.
    ///
    /// Fails when `now + retry_delay` is not a representable time.
    pub fn on_failure(
        &self,
        attempts_before: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let attempts = attempts_before.saturating_add(1);
        if should_give_up(attempts, max_attempts) {
            return Ok(FailureOutcome::Exhausted { attempts });
        }
        let next_retry_at =
            now.checked_add_signed(self.retry_delay).ok_or_else(|| {
                JobError::validation("next retry time is out of range")
            })?;
        Ok(FailureOutcome::Retry {
            attempts,
            next_retry_at,
        })
    }
}

/// True once `attempts` has reached the job's ceiling.
pub fn should_give_up(attempts: i32, max_attempts: i32) -> bool {
    attempts >= max_attempts
}
