//! Per-queue counts and latency aggregates.

use std::collections::BTreeMap;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Running average/maximum over millisecond samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<i64>,
}

impl LatencySummary {
    pub fn from_parts(samples: u64, avg_ms: Option<f64>, max_ms: Option<i64>) -> Self {
        Self {
            samples,
            avg_ms,
            max_ms,
        }
    }

    pub fn observe(&mut self, ms: i64) {
        let total = self.avg_ms.unwrap_or(0.0) * self.samples as f64 + ms as f64;
        self.samples += 1;
        self.avg_ms = Some(total / self.samples as f64);
        self.max_ms = Some(self.max_ms.map_or(ms, |max| max.max(ms)));
    }
}

/// Snapshot of one queue.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Number of jobs waiting to be leased for the first time or again
    /// after a manual retry.
    pub queued: u64,
    /// Number of jobs whose start time lies in the future.
    pub delayed: u64,
    /// Number of jobs currently leased by a worker.
    pub processing: u64,
    pub completed: u64,
    /// Failed jobs, including those still waiting for a retry.
    pub failed: u64,
    /// Subset of `failed` with a retry scheduled.
    pub retry_pending: u64,
    pub cancelled: u64,
    /// Time from creation to lease.
    pub wait_time: LatencySummary,
    /// Handler execution time of completed jobs.
    pub processing_time: LatencySummary,
}

impl QueueStats {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    pub fn total(&self) -> u64 {
        self.queued
            + self.delayed
            + self.processing
            + self.completed
            + self.failed
            + self.cancelled
    }

    pub fn add_status(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Delayed => self.delayed += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn observe(&mut self, job: &Job) {
        self.add_status(job.status, 1);
        if job.is_retry_pending() {
            self.retry_pending += 1;
        }
        if let Some(wait) = job.wait_time() {
            self.wait_time.observe(wait.num_milliseconds());
        }
        if job.status == JobStatus::Completed {
            if let Some(ms) = job.processing_time_ms {
                self.processing_time.observe(ms);
            }
        }
    }
}

/// Aggregate stats for every queue that has jobs, keyed by queue name.
pub fn collect_queue_stats<'a>(
    jobs: impl IntoIterator<Item = &'a Job>,
) -> BTreeMap<String, QueueStats> {
    let mut out = BTreeMap::new();
    for job in jobs {
        out.entry(job.queue_name.clone())
            .or_insert_with(|| QueueStats::new(&job.queue_name))
            .observe(job);
    }
    out
}

/// Width of a metrics time bucket.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketSize {
    Minute,
    Hour,
    Day,
}

impl BucketSize {
    pub fn width(&self) -> TimeDelta {
        match self {
            BucketSize::Minute => TimeDelta::minutes(1),
            BucketSize::Hour => TimeDelta::hours(1),
            BucketSize::Day => TimeDelta::days(1),
        }
    }

    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.duration_trunc(self.width()).unwrap_or(at)
    }
}

/// Throughput and latency of one queue within one time bucket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub bucket_start: DateTime<Utc>,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub wait_time: LatencySummary,
    pub processing_time: LatencySummary,
}

/// Bucket jobs of `queue_name` by event time, keeping events at or after
/// `since`.
///
/// Enqueues count by `created_at`, waits by `started_at`, completions and
/// processing time by `completed_at`, failures by `failed_at`.
pub fn bucket_metrics<'a>(
    jobs: impl IntoIterator<Item = &'a Job>,
    queue_name: &str,
    size: BucketSize,
    since: DateTime<Utc>,
) -> Vec<MetricsBucket> {
    let mut buckets: BTreeMap<DateTime<Utc>, MetricsBucket> = BTreeMap::new();

    for job in jobs.into_iter().filter(|j| j.queue_name == queue_name) {
        if job.created_at >= since {
            bucket_for(&mut buckets, size, job.created_at).enqueued += 1;
        }
        if let (Some(started), Some(wait)) = (job.started_at, job.wait_time())
        {
            if started >= since {
                bucket_for(&mut buckets, size, started)
                    .wait_time
                    .observe(wait.num_milliseconds());
            }
        }
        if let Some(done) = job.completed_at.filter(|at| *at >= since) {
            let entry = bucket_for(&mut buckets, size, done);
            entry.completed += 1;
            if let Some(ms) = job.processing_time_ms {
                entry.processing_time.observe(ms);
            }
        }
        if let Some(failed) = job.failed_at.filter(|at| *at >= since) {
            if job.status == JobStatus::Failed {
                bucket_for(&mut buckets, size, failed).failed += 1;
            }
        }
    }

    buckets.into_values().collect()
}

fn bucket_for(
    buckets: &mut BTreeMap<DateTime<Utc>, MetricsBucket>,
    size: BucketSize,
    at: DateTime<Utc>,
) -> &mut MetricsBucket {
    let start = size.truncate(at);
    buckets.entry(start).or_insert_with(|| MetricsBucket {
        bucket_start: start,
        ..Default::default()
    })
}

/// Outcome of a retention cleanup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub jobs_deleted: u64,
    pub logs_deleted: u64,
}
