use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobStatus};

/// Request to lease the next eligible job from one queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Queue to take work from.
    pub queue_name: String,
    /// Identity recorded in `locked_by`.
    pub worker_id: String,
}

impl LeaseRequest {
    pub fn new(
        queue_name: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            worker_id: worker_id.into(),
        }
    }
}

/// A job currently owned by one worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    /// Snapshot of the job as it was when the lease was taken.
    pub job: Job,
    /// ID of the worker holding this lease.
    pub worker_id: String,
    /// Lease start, mirrored in the job's `locked_at`.
    pub leased_at: DateTime<Utc>,
}

impl JobLease {
    /// Wrap a job that has just been marked `processing`.
    pub fn from_job(job: Job) -> Option<Self> {
        let worker_id = job.locked_by.clone()?;
        let leased_at = job.locked_at?;
        Some(Self {
            job,
            worker_id,
            leased_at,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// The 1-based number of the attempt this lease runs.
    pub fn attempt(&self) -> i32 {
        self.job.attempts + 1
    }

    /// How long the job waited in the queue before this lease.
    pub fn wait_time(&self) -> Duration {
        self.leased_at - self.job.created_at
    }
}

/// Status and timing checks for lease eligibility.
///
/// Dependency, pause and concurrency checks need store state and are
/// applied by the store around this predicate.
pub fn is_eligible(job: &Job, now: DateTime<Utc>) -> bool {
    if job.attempts >= job.max_attempts {
        return false;
    }
    if job.scheduled_for.is_some_and(|at| at > now) {
        return false;
    }
    match job.status {
        JobStatus::Queued | JobStatus::Delayed => {
            job.next_retry_at.map_or(true, |at| at <= now)
        }
        JobStatus::Failed => job.next_retry_at.is_some_and(|at| at <= now),
        JobStatus::Processing
        | JobStatus::Completed
        | JobStatus::Cancelled => false,
    }
}

/// Order in which eligible jobs are offered: highest priority first, then
/// oldest first. The id breaks exact ties so the order is total.
pub fn lease_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// A `processing` job whose lease began before `now - threshold`.
pub fn is_stuck(job: &Job, now: DateTime<Utc>, threshold: Duration) -> bool {
    let Some(cutoff) = now.checked_sub_signed(threshold) else {
        return false;
    };
    job.status == JobStatus::Processing
        && job.locked_at.is_some_and(|at| at < cutoff)
}

/// A delayed job whose start time has arrived.
pub fn is_due_for_promotion(job: &Job, now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Delayed
        && job.scheduled_for.map_or(true, |at| at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::queue::QueueConfig;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn job_at(priority: i32, created: DateTime<Utc>) -> Job {
        NewJob::new("q", "t", json!({}))
            .with_priority(priority)
            .into_job(&QueueConfig::new("q"), created)
            .unwrap()
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let a = job_at(5, now());
        let b = job_at(1, now() + Duration::seconds(1));
        let c = job_at(5, now() + Duration::seconds(2));
        let mut jobs = vec![b.clone(), c.clone(), a.clone()];
        jobs.sort_by(lease_order);
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);
    }

    #[test]
    fn test_queued_job_eligible() {
        assert!(is_eligible(&job_at(0, now()), now()));
    }

    #[test]
    fn test_future_schedule_not_eligible() {
        let mut job = job_at(0, now());
        job.scheduled_for = Some(now() + Duration::hours(1));
        job.status = JobStatus::Delayed;
        assert!(!is_eligible(&job, now()));
        assert!(!is_eligible(&job, now() + Duration::minutes(59)));
        assert!(is_eligible(&job, now() + Duration::hours(1)));
    }

    #[test]
    fn test_failed_job_waits_for_retry_time() {
        let mut job = job_at(0, now());
        job.status = JobStatus::Failed;
        job.attempts = 1;
        job.next_retry_at = Some(now() + Duration::seconds(60));
        assert!(!is_eligible(&job, now()));
        assert!(is_eligible(&job, now() + Duration::seconds(60)));
    }

    #[test]
    fn test_terminal_failure_not_eligible() {
        let mut job = job_at(0, now());
        job.status = JobStatus::Failed;
        job.attempts = job.max_attempts;
        assert!(!is_eligible(&job, now() + Duration::days(1)));
    }

    #[test]
    fn test_processing_not_eligible() {
        let mut job = job_at(0, now());
        job.mark_leased("w1", now());
        assert!(!is_eligible(&job, now()));
    }

    #[test]
    fn test_stuck_detection() {
        let mut job = job_at(0, now());
        job.mark_leased("w1", now());
        let hour = Duration::hours(1);
        assert!(!is_stuck(&job, now() + Duration::minutes(30), hour));
        assert!(is_stuck(&job, now() + Duration::minutes(61), hour));
    }

    #[test]
    fn test_huge_stuck_threshold_never_reclaims() {
        let mut job = job_at(0, now());
        job.mark_leased("w1", now());
        let forever = Duration::MAX;
        assert!(!is_stuck(&job, now() + Duration::days(365), forever));
    }

    #[test]
    fn test_lease_from_job() {
        let mut job = job_at(0, now() - Duration::seconds(5));
        assert!(JobLease::from_job(job.clone()).is_none());
        job.mark_leased("w1", now());
        let lease = JobLease::from_job(job).unwrap();
        assert_eq!(lease.worker_id, "w1");
        assert_eq!(lease.attempt(), 1);
        assert_eq!(lease.wait_time(), Duration::seconds(5));
    }
}
