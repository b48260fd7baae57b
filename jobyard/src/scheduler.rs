//! Recurring job firing.
//!
//! Each tick lists the definitions, and for every enabled one that is due
//! claims the firing with a compare-and-set on `last_run_at` before
//! enqueueing. Only the scheduler that wins the claim enqueues, so several
//! processes can tick the same store without double firing.

use std::sync::Arc;

use tracing::Instrument;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::JobId;
use crate::recurring::{RecurringJob, RecurringJobId};
use crate::runtime::ShutdownToken;
use crate::store::Store;
use crate::telemetry;

pub struct RecurringScheduler<S> {
    store: Arc<S>,
    events: Arc<dyn JobEventPublisher>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl<S> Clone for RecurringScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<S> std::fmt::Debug for RecurringScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringScheduler")
            .field("store_type", &std::any::type_name::<S>())
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: Store> RecurringScheduler<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn JobEventPublisher>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
        }
    }

    /// Fire every due definition once. Returns how many jobs were created.
    ///
    /// A definition with an unparseable schedule, or whose enqueue fails,
    /// is logged and skipped; the rest still fire.
    pub async fn tick(&self) -> Result<usize> {
        async {
            let now = self.clock.now();
            let mut fired = 0;

            for definition in self.store.list_recurring().await? {
                let due = match definition.is_due(now) {
                    Ok(due) => due,
                    Err(err) => {
                        tracing::warn!(
                            name = %definition.name,
                            "skipping recurring job with bad schedule: {err}"
                        );
                        continue;
                    }
                };
                if !due {
                    continue;
                }

                let claimed = self
                    .store
                    .claim_recurring_run(
                        definition.id,
                        definition.last_run_at,
                        now,
                    )
                    .await?;
                if !claimed {
                    tracing::debug!(
                        name = %definition.name,
                        "recurring firing claimed elsewhere"
                    );
                    continue;
                }

                match self.enqueue_instance(&definition, false).await {
                    Ok(_) => fired += 1,
                    Err(err) => tracing::warn!(
                        name = %definition.name,
                        "recurring enqueue failed: {err}"
                    ),
                }
            }

            Ok(fired)
        }
        .instrument(telemetry::recurring_span(false))
        .await
    }

    /// Enqueue one instance now, regardless of schedule or enabled flag.
    ///
    /// Also moves `last_run_at` forward so the next scheduled firing counts
    /// from this run.
    pub async fn trigger(&self, id: RecurringJobId) -> Result<JobId> {
        async {
            let definition = self.store.get_recurring(id).await?;
            let now = self.clock.now();
            if !self
                .store
                .claim_recurring_run(id, definition.last_run_at, now)
                .await?
            {
                tracing::debug!(
                    name = %definition.name,
                    "last_run_at changed concurrently during manual trigger"
                );
            }
            self.enqueue_instance(&definition, true).await
        }
        .instrument(telemetry::recurring_span(true))
        .await
    }

    /// Tick on every interval until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownToken) {
        let interval = self.config.tick_interval();
        tracing::info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "recurring scheduler started"
        );
        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!("recurring scheduler tick failed: {err}");
            }
            if shutdown.sleep(interval).await {
                break;
            }
        }
        tracing::info!("recurring scheduler shutting down");
    }

    async fn enqueue_instance(
        &self,
        definition: &RecurringJob,
        manual: bool,
    ) -> Result<JobId> {
        let new_job = definition.instantiate();
        let queue_name = new_job.queue_name.clone();
        let job_type = new_job.job_type.clone();
        let priority = new_job.options.priority;

        let job_id = self.store.enqueue(new_job).await?;

        telemetry::record_job_enqueued(&queue_name, &job_type);
        telemetry::record_recurring_fired(&definition.name, manual);
        self.publish(JobEventPayload::Enqueued {
            job_id,
            queue_name,
            job_type,
            priority,
        })
        .await;
        self.publish(JobEventPayload::RecurringFired {
            recurring_job_id: definition.id,
            job_id,
            manual,
        })
        .await;
        Ok(job_id)
    }

    async fn publish(&self, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(payload)).await {
            tracing::warn!("publish event failed: {err}");
        }
    }
}
