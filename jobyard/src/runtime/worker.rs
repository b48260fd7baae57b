use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::Result;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::handler::{DispatchStatus, ExecutionContext, JobDispatcher};
use crate::job::{JobFailure, StatusUpdate};
use crate::lease::{JobLease, LeaseRequest};
use crate::queue::DEFAULT_TIMEOUT_SECONDS;
use crate::store::{JobStore, Store};
use crate::telemetry;
use crate::workers::WorkerRegistration;

use super::shutdown::ShutdownToken;

/// Configuration shared by the worker loops of one process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queues polled in order on every cycle.
    pub queues: Vec<String>,
    /// Sleep when no queue had work, in milliseconds.
    pub poll_interval_ms: u64,
    /// Heartbeat period while a handler runs, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Sleep after a store error, in milliseconds.
    pub error_backoff_ms: u64,
    /// Host identity; falls back to `$HOSTNAME`, then `localhost`.
    pub hostname: Option<String>,
}

impl WorkerConfig {
    pub fn new<I, Q>(queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set the backoff after a store error.
    pub fn with_error_backoff(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    /// Set the hostname reported at registration.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn resolved_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// `{hostname}-{pid}-w{index}`.
    pub fn worker_id(&self, index: usize) -> String {
        format!(
            "{}-{}-w{}",
            self.resolved_hostname(),
            std::process::id(),
            index
        )
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            poll_interval_ms: 1_000,
            heartbeat_interval_ms: 30_000,
            error_backoff_ms: 5_000,
            hostname: None,
        }
    }
}

/// One worker: registers itself, leases and runs one job at a time, and
/// marks itself stopped on shutdown.
pub struct WorkerLoop<S, D> {
    worker_id: String,
    config: WorkerConfig,
    store: Arc<S>,
    dispatcher: Arc<D>,
    events: Arc<dyn JobEventPublisher>,
}

impl<S, D> std::fmt::Debug for WorkerLoop<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .field("store_type", &std::any::type_name::<S>())
            .field("dispatcher_type", &std::any::type_name::<D>())
            .finish()
    }
}

impl<S, D> WorkerLoop<S, D>
where
    S: Store,
    D: JobDispatcher + 'static,
{
    pub fn new(
        worker_id: impl Into<String>,
        config: WorkerConfig,
        store: Arc<S>,
        dispatcher: Arc<D>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            config,
            store,
            dispatcher,
            events,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn registration(&self) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: self.worker_id.clone(),
            hostname: self.config.resolved_hostname(),
            pid: std::process::id(),
            queues: self.config.queues.clone(),
        }
    }

    /// Run until `shutdown` fires. An in-flight job is always finished
    /// before the loop exits.
    pub async fn run(self, shutdown: ShutdownToken) {
        let backoff = Duration::from_millis(self.config.error_backoff_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            match self.store.register_worker(self.registration()).await {
                Ok(_) => break,
                Err(err) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        "worker registration failed: {err}"
                    );
                    if shutdown.sleep(backoff).await {
                        return;
                    }
                }
            }
        }
        tracing::info!(
            worker_id = %self.worker_id,
            queues = ?self.config.queues,
            "worker started"
        );
        self.publish(JobEventPayload::WorkerStarted {
            worker_id: self.worker_id.clone(),
        })
        .await;

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    shutdown.sleep(poll).await;
                }
                Err(err) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        "worker poll failed: {err}"
                    );
                    shutdown.sleep(backoff).await;
                }
            }
        }

        if let Err(err) = self.store.stop_worker(&self.worker_id).await {
            tracing::warn!(
                worker_id = %self.worker_id,
                "failed to mark worker stopped: {err}"
            );
        }
        self.publish(JobEventPayload::WorkerStopped {
            worker_id: self.worker_id.clone(),
            by_supervisor: false,
        })
        .await;
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// One poll cycle: heartbeat, then try each queue in order and run the
    /// first job leased. Returns whether a job ran.
    pub async fn poll_once(&self) -> Result<bool> {
        self.store.heartbeat(&self.worker_id, None).await?;

        for queue in &self.config.queues {
            let request = LeaseRequest::new(queue, &self.worker_id);
            let lease = self
                .store
                .lease_next(&request)
                .instrument(telemetry::job_lease_span(&self.worker_id, queue))
                .await?;
            match lease {
                Some(lease) => {
                    self.execute(lease).await;
                    return Ok(true);
                }
                None => {
                    tracing::debug!(
                        worker_id = %self.worker_id,
                        queue = %queue,
                        "no eligible job"
                    );
                }
            }
        }
        Ok(false)
    }

    /// Run a leased job to completion and record its outcome.
    ///
    /// Store errors while recording the outcome are logged; the job stays
    /// `processing` and is eventually reclaimed by the supervisor.
    pub async fn execute(&self, lease: JobLease) {
        let job_id = lease.job_id();
        let queue = lease.job.queue_name.clone();
        let job_type = lease.job.job_type.clone();

        telemetry::observe_job_wait(
            &queue,
            lease.wait_time().num_milliseconds().max(0) as f64 / 1000.0,
        );
        self.publish(JobEventPayload::Leased {
            job_id,
            queue_name: queue.clone(),
            worker_id: self.worker_id.clone(),
            attempt: lease.attempt(),
        })
        .await;

        let timeout = self.timeout_for(&lease).await;
        let ticker = self.spawn_heartbeat(&lease);
        let store: Arc<dyn JobStore> = self.store.clone();
        let ctx = ExecutionContext::new(
            &lease,
            timeout,
            store,
            Arc::clone(&self.events),
        );

        let timing = telemetry::record_job_start(job_id.to_string());
        let status = telemetry::instrument_execute(
            job_id.to_string(),
            &job_type,
            lease.attempt(),
            self.dispatcher.dispatch(&lease, ctx),
        )
        .await;
        let processing_time_ms = timing.elapsed_ms();
        ticker.stop().await;

        if timing.elapsed() > timeout {
            tracing::warn!(
                job_id = %job_id,
                job_type = %job_type,
                timeout_secs = timeout.as_secs(),
                elapsed_ms = processing_time_ms,
                "handler exceeded its timeout"
            );
        }

        match status {
            DispatchStatus::Success { result } => {
                let update = StatusUpdate::Completed {
                    worker_id: self.worker_id.clone(),
                    result,
                    processing_time_ms,
                };
                match self.store.update_status(job_id, update).await {
                    Ok(_) => {
                        telemetry::record_job_end(
                            &timing, &queue, &job_type, "completed",
                        );
                        telemetry::record_job_finished(
                            &queue, &job_type, "completed",
                        );
                        self.publish(JobEventPayload::Completed {
                            job_id,
                            queue_name: queue.clone(),
                            job_type: job_type.clone(),
                            processing_time_ms,
                        })
                        .await;
                    }
                    Err(err) => {
                        tracing::error!(
                            job_id = %job_id,
                            "failed to record completion: {err}"
                        );
                    }
                }
            }
            DispatchStatus::Failure { error } => {
                let mut failure = JobFailure::new(error.message.clone())
                    .with_processing_time_ms(processing_time_ms);
                if let Some(stack) = error.stack {
                    failure = failure.with_stack(stack);
                }
                let update = StatusUpdate::Failed {
                    worker_id: self.worker_id.clone(),
                    failure,
                };
                match self.store.update_status(job_id, update).await {
                    Ok(job) => {
                        let will_retry = job.is_retry_pending();
                        let outcome = if will_retry { "retry" } else { "failed" };
                        tracing::warn!(
                            job_id = %job_id,
                            job_type = %job_type,
                            attempts = job.attempts,
                            max_attempts = job.max_attempts,
                            will_retry,
                            "job attempt failed: {}",
                            error.message
                        );
                        telemetry::record_job_end(
                            &timing, &queue, &job_type, outcome,
                        );
                        telemetry::record_job_finished(
                            &queue, &job_type, outcome,
                        );
                        self.publish(JobEventPayload::Failed {
                            job_id,
                            queue_name: queue.clone(),
                            job_type: job_type.clone(),
                            attempts: job.attempts,
                            will_retry,
                            error: error.message,
                        })
                        .await;
                    }
                    Err(err) => {
                        tracing::error!(
                            job_id = %job_id,
                            "failed to record failure: {err}"
                        );
                    }
                }
            }
        }

        if let Err(err) = self.store.heartbeat(&self.worker_id, None).await {
            tracing::warn!(worker_id = %self.worker_id, "heartbeat failed: {err}");
        }
    }

    async fn timeout_for(&self, lease: &JobLease) -> Duration {
        let seconds = match lease.job.timeout_seconds {
            Some(seconds) => seconds,
            None => match self.store.queue_config(&lease.job.queue_name).await {
                Ok(config) => config.timeout_seconds,
                Err(err) => {
                    tracing::debug!("queue config lookup failed: {err}");
                    DEFAULT_TIMEOUT_SECONDS
                }
            },
        };
        Duration::from_secs(u64::try_from(seconds.max(1)).unwrap_or(1))
    }

    fn spawn_heartbeat(&self, lease: &JobLease) -> HeartbeatTicker {
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let store = Arc::clone(&self.store);
        let worker_id = self.worker_id.clone();
        let job_id = lease.job_id();
        let period =
            Duration::from_millis(self.config.heartbeat_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        if let Err(err) =
                            store.heartbeat(&worker_id, Some(job_id)).await
                        {
                            tracing::warn!(
                                worker_id = %worker_id,
                                "heartbeat failed: {err}"
                            );
                        }
                    }
                }
            }
        });

        HeartbeatTicker { stop_tx, handle }
    }

    async fn publish(&self, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(payload)).await {
            tracing::warn!("publish event failed: {err}");
        }
    }
}

struct HeartbeatTicker {
    stop_tx: tokio::sync::oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatTicker {
    async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(err) = self.handle.await {
            tracing::warn!("heartbeat task failed: {err}");
        }
    }
}
