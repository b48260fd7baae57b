use std::sync::Arc;

use tracing::Instrument;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::JobId;
use crate::store::Store;
use crate::telemetry;

use super::shutdown::ShutdownToken;

/// What one sweep changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: u64,
    pub reclaimed: Vec<JobId>,
    pub workers_stopped: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.promoted == 0
            && self.reclaimed.is_empty()
            && self.workers_stopped.is_empty()
    }
}

/// Periodic repair of state left behind by crashed or silent workers.
///
/// Every step is idempotent, so any number of supervisors may run against
/// the same store.
pub struct Supervisor<S> {
    store: Arc<S>,
    events: Arc<dyn JobEventPublisher>,
    config: SupervisorConfig,
}

impl<S> std::fmt::Debug for Supervisor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("store_type", &std::any::type_name::<S>())
            .field("config", &self.config)
            .finish()
    }
}

impl<S: Store> Supervisor<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn JobEventPublisher>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Promote due delayed jobs, reclaim stuck jobs, stop silent workers.
    pub async fn sweep(&self) -> Result<SweepReport> {
        async {
            let promoted = self.store.promote_delayed().await?;
            if promoted > 0 {
                tracing::info!(promoted, "delayed jobs promoted");
            }

            let reclaimed = self
                .store
                .reclaim_stuck(self.config.stuck_job_threshold())
                .await?;
            telemetry::record_jobs_reclaimed(reclaimed.len());
            for job_id in &reclaimed {
                self.publish(JobEventPayload::Reclaimed { job_id: *job_id })
                    .await;
            }

            let workers_stopped = self
                .store
                .stop_silent_workers(self.config.worker_silence_threshold())
                .await?;
            telemetry::record_workers_stopped(workers_stopped.len());
            for worker_id in &workers_stopped {
                self.publish(JobEventPayload::WorkerStopped {
                    worker_id: worker_id.clone(),
                    by_supervisor: true,
                })
                .await;
            }

            Ok(SweepReport {
                promoted,
                reclaimed,
                workers_stopped,
            })
        }
        .instrument(telemetry::sweep_span())
        .await
    }

    /// Sweep on every interval until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownToken) {
        let interval = self.config.interval();
        tracing::info!(interval_ms = self.config.interval_ms, "supervisor started");
        loop {
            if let Err(err) = self.sweep().await {
                tracing::warn!("supervisor sweep failed: {err}");
            }
            if shutdown.sleep(interval).await {
                break;
            }
        }
        tracing::info!("supervisor shutting down");
    }

    async fn publish(&self, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(payload)).await {
            tracing::warn!("publish event failed: {err}");
        }
    }
}
