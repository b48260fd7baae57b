use std::sync::Arc;

use crate::config::CleanupConfig;
use crate::error::Result;
use crate::job::JobStatus;
use crate::stats::{CleanupReport, QueueStats};
use crate::store::Store;
use crate::telemetry;

use super::shutdown::ShutdownToken;

/// Retention cleanup plus refresh of the per-queue gauges.
pub struct CleanupTask<S> {
    store: Arc<S>,
    config: CleanupConfig,
}

impl<S> std::fmt::Debug for CleanupTask<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupTask")
            .field("store_type", &std::any::type_name::<S>())
            .field("config", &self.config)
            .finish()
    }
}

impl<S: Store> CleanupTask<S> {
    pub fn new(store: Arc<S>, config: CleanupConfig) -> Self {
        Self { store, config }
    }

    pub async fn run_once(&self) -> Result<CleanupReport> {
        let report = self.store.cleanup(self.config.retention()).await?;
        if report.jobs_deleted > 0 {
            tracing::info!(
                jobs_deleted = report.jobs_deleted,
                logs_deleted = report.logs_deleted,
                retention_days = self.config.retention_days,
                "old jobs cleaned up"
            );
        }
        self.refresh_gauges().await?;
        Ok(report)
    }

    pub async fn refresh_gauges(&self) -> Result<()> {
        for stats in self.store.all_queue_stats().await? {
            publish_queue_gauges(&stats);
        }
        Ok(())
    }

    pub async fn run(self, shutdown: ShutdownToken) {
        let interval = self.config.interval();
        loop {
            if let Err(err) = self.run_once().await {
                tracing::warn!("cleanup failed: {err}");
            }
            if shutdown.sleep(interval).await {
                break;
            }
        }
        tracing::info!("cleanup task shutting down");
    }
}

fn publish_queue_gauges(stats: &QueueStats) {
    for status in JobStatus::ALL {
        let count = match status {
            JobStatus::Queued => stats.queued,
            JobStatus::Delayed => stats.delayed,
            JobStatus::Processing => stats.processing,
            JobStatus::Completed => stats.completed,
            JobStatus::Failed => stats.failed,
            JobStatus::Cancelled => stats.cancelled,
        };
        telemetry::set_queue_jobs(&stats.queue_name, status.as_str(), count);
    }
    telemetry::set_queue_jobs(&stats.queue_name, "retry_pending", stats.retry_pending);
}
