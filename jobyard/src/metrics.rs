//! Prometheus metrics instrumentation for jobyard.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `jobyard_jobs_enqueued_total` - Jobs created
//! - `jobyard_jobs_finished_total` - Attempts finished, by outcome
//! - `jobyard_jobs_reclaimed_total` - Stuck jobs returned to their queue
//! - `jobyard_workers_stopped_total` - Silent workers stopped by the supervisor
//! - `jobyard_recurring_fired_total` - Jobs created from recurring definitions
//!
//! ## Gauges
//! - `jobyard_queue_jobs` - Jobs per queue and status
//!
//! ## Histograms
//! - `jobyard_job_duration_seconds` - Handler execution time
//! - `jobyard_job_wait_seconds` - Time between creation and lease
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramOpts, HistogramVec,
    IntCounter, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for jobyard metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `queue`, `job_type`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("jobyard_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["queue", "job_type"])
        .expect("jobyard_jobs_enqueued_total metric creation failed")
});

/// Labels: `queue`, `job_type`, `outcome` (completed, retry, failed).
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobyard_jobs_finished_total",
        "Total number of job attempts finished",
    );
    CounterVec::new(opts, &["queue", "job_type", "outcome"])
        .expect("jobyard_jobs_finished_total metric creation failed")
});

pub static JOBS_RECLAIMED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "jobyard_jobs_reclaimed_total",
        "Total number of stuck jobs returned to their queue",
    )
    .expect("jobyard_jobs_reclaimed_total metric creation failed")
});

pub static WORKERS_STOPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "jobyard_workers_stopped_total",
        "Total number of silent workers marked stopped",
    )
    .expect("jobyard_workers_stopped_total metric creation failed")
});

/// Labels: `name` of the recurring definition.
pub static RECURRING_FIRED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobyard_recurring_fired_total",
        "Total number of jobs created from recurring definitions",
    );
    CounterVec::new(opts, &["name"])
        .expect("jobyard_recurring_fired_total metric creation failed")
});

/// Labels: `queue`, `status`.
pub static QUEUE_JOBS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("jobyard_queue_jobs", "Current number of jobs per queue and status");
    GaugeVec::new(opts, &["queue", "status"])
        .expect("jobyard_queue_jobs metric creation failed")
});

/// Labels: `queue`, `job_type`, `outcome`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "jobyard_job_duration_seconds",
        "Job handler execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "job_type", "outcome"])
        .expect("jobyard_job_duration_seconds metric creation failed")
});

/// Labels: `queue`.
pub static JOB_WAIT_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "jobyard_job_wait_seconds",
        "Time between job creation and lease in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue"])
        .expect("jobyard_job_wait_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_RECLAIMED_TOTAL.clone()),
        Box::new(WORKERS_STOPPED_TOTAL.clone()),
        Box::new(RECURRING_FIRED_TOTAL.clone()),
        Box::new(QUEUE_JOBS.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
        Box::new(JOB_WAIT_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(queue: &str, job_type: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[queue, job_type]).inc();
}

pub fn record_job_finished(queue: &str, job_type: &str, outcome: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[queue, job_type, outcome])
        .inc();
}

pub fn record_jobs_reclaimed(count: u64) {
    JOBS_RECLAIMED_TOTAL.inc_by(count);
}

pub fn record_workers_stopped(count: u64) {
    WORKERS_STOPPED_TOTAL.inc_by(count);
}

pub fn record_recurring_fired(name: &str) {
    RECURRING_FIRED_TOTAL.with_label_values(&[name]).inc();
}

pub fn set_queue_jobs(queue: &str, status: &str, count: f64) {
    QUEUE_JOBS.with_label_values(&[queue, status]).set(count);
}

pub fn observe_job_duration(queue: &str, job_type: &str, outcome: &str, secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[queue, job_type, outcome])
        .observe(secs);
}

pub fn observe_job_wait(queue: &str, secs: f64) {
    JOB_WAIT_SECONDS.with_label_values(&[queue]).observe(secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
