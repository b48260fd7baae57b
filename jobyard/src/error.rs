use thiserror::Error;

use crate::job::{JobId, JobStatus};
use crate::recurring::RecurringJobId;

/// Errors surfaced by the job store and the service layer.
///
/// Validation-class variants leave stored state untouched. Store-class
/// variants (`Database`, `StoreUnavailable`) are the only ones a worker
/// loop treats as "back off and try again".
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// Caller supplied parameters that can never be accepted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("recurring job {0} not found")]
    RecurringJobNotFound(RecurringJobId),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    /// The requested status change is not allowed from the current status.
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// A manual retry without attempt reset on a job with no attempts left.
    #[error("job {job_id} exhausted its attempts ({attempts}/{max_attempts})")]
    AttemptsExhausted {
        job_id: JobId,
        attempts: i32,
        max_attempts: i32,
    },

    /// Completion or failure reported by a worker that no longer holds the
    /// lease, usually because the supervisor reclaimed the job.
    #[error("job {job_id} is not leased by worker {worker_id}")]
    LeaseNotHeld { job_id: JobId, worker_id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl JobError {
    /// Shorthand for [`JobError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures of the backing store itself rather than of the
    /// request.
    pub fn is_store_failure(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            #[cfg(feature = "postgres")]
            Self::Database(_) => true,
            _ => false,
        }
    }

    /// True for errors that mean the caller asked for something that does
    /// not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_)
                | Self::RecurringJobNotFound(_)
                | Self::WorkerNotFound(_)
        )
    }
}

pub type Result<T, E = JobError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        assert!(JobError::StoreUnavailable("down".into()).is_store_failure());
        assert!(!JobError::validation("bad").is_store_failure());
        assert!(!JobError::JobNotFound(JobId::new()).is_store_failure());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(JobError::JobNotFound(JobId::new()).is_not_found());
        assert!(JobError::WorkerNotFound("w".into()).is_not_found());
        assert!(!JobError::Conflict("dup".into()).is_not_found());
    }

    #[test]
    fn test_transition_message() {
        let id = JobId::new();
        let err = JobError::InvalidTransition {
            job_id: id,
            from: JobStatus::Processing,
            to: JobStatus::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            format!("job {id} cannot move from processing to cancelled")
        );
    }
}
