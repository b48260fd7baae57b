//! Tracing and telemetry instrumentation for jobyard.
//!
//! Span builders and `record_*` helpers used along the job lifecycle. The
//! helpers always log through `tracing` and additionally update Prometheus
//! series when the `metrics` feature is enabled.
//!
//! # Example
//!
//! ```ignore
//! use jobyard::telemetry::{job_execute_span, record_job_finished};
//!
//! let span = job_execute_span(&job_id.to_string(), "send_email", 1);
//! let _enter = span.enter();
//! // ... handler runs
//! record_job_finished("mail", "send_email", "completed");
//! ```

use std::future::Future;

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

/// Span around one lease attempt on one queue.
#[must_use]
pub fn job_lease_span(worker_id: impl AsRef<str>, queue: impl AsRef<str>) -> Span {
    info_span!(
        "jobyard.lease",
        worker_id = %worker_id.as_ref(),
        queue = %queue.as_ref(),
    )
}

/// Span around a handler invocation.
#[must_use]
pub fn job_execute_span(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    attempt: i32,
) -> Span {
    info_span!(
        "jobyard.execute",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        attempt = attempt,
    )
}

#[must_use]
pub fn job_enqueue_span(queue: impl AsRef<str>, job_type: impl AsRef<str>) -> Span {
    info_span!(
        "jobyard.enqueue",
        queue = %queue.as_ref(),
        job_type = %job_type.as_ref(),
    )
}

/// Span around one supervisor sweep.
#[must_use]
pub fn sweep_span() -> Span {
    info_span!("jobyard.sweep")
}

/// Span around one recurring scheduler tick.
#[must_use]
pub fn recurring_span(manual: bool) -> Span {
    info_span!("jobyard.recurring", manual = manual)
}

/// Instrument a future with an execute span.
pub fn instrument_execute<F>(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    attempt: i32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(job_execute_span(job_id, job_type, attempt))
}

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))
}

pub fn record_job_enqueued(queue: impl AsRef<str>, job_type: impl AsRef<str>) {
    tracing::info!(
        queue = %queue.as_ref(),
        job_type = %job_type.as_ref(),
        "job enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(queue.as_ref(), job_type.as_ref());
}

/// Record the outcome of one attempt.
///
/// `outcome` is `completed`, `retry` or `failed`.
pub fn record_job_finished(
    queue: impl AsRef<str>,
    job_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    tracing::info!(
        queue = %queue.as_ref(),
        job_type = %job_type.as_ref(),
        outcome = %outcome.as_ref(),
        "job attempt finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(
        queue.as_ref(),
        job_type.as_ref(),
        outcome.as_ref(),
    );
}

pub fn record_jobs_reclaimed(count: usize) {
    if count == 0 {
        return;
    }
    tracing::warn!(count, "stuck jobs returned to queue");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_reclaimed(count as u64);
}

pub fn record_workers_stopped(count: usize) {
    if count == 0 {
        return;
    }
    tracing::warn!(count, "silent workers marked stopped");

    #[cfg(feature = "metrics")]
    crate::metrics::record_workers_stopped(count as u64);
}

pub fn record_recurring_fired(name: impl AsRef<str>, manual: bool) {
    tracing::info!(name = %name.as_ref(), manual, "recurring job fired");

    #[cfg(feature = "metrics")]
    crate::metrics::record_recurring_fired(name.as_ref());
}

/// Update the per-queue, per-status job gauge.
pub fn set_queue_jobs(queue: impl AsRef<str>, status: impl AsRef<str>, count: u64) {
    tracing::debug!(
        queue = %queue.as_ref(),
        status = %status.as_ref(),
        count,
        "queue gauge updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_jobs(queue.as_ref(), status.as_ref(), count as f64);
}

/// Observe time a job spent waiting between creation and lease.
pub fn observe_job_wait(queue: impl AsRef<str>, wait_secs: f64) {
    tracing::debug!(queue = %queue.as_ref(), wait_secs, "job wait observed");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_wait(queue.as_ref(), wait_secs);
}

/// Start timing a handler execution.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Finish timing and observe the duration.
pub fn record_job_end(
    handle: &JobTimingHandle,
    queue: impl AsRef<str>,
    job_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    let duration_secs = handle.elapsed().as_secs_f64();
    tracing::debug!(
        job_id = %handle.job_id,
        queue = %queue.as_ref(),
        job_type = %job_type.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(
        queue.as_ref(),
        job_type.as_ref(),
        outcome.as_ref(),
        duration_secs,
    );
}

/// Handle returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Elapsed wall-clock time in whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}
