use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::events::{InProcEventBus, JobEventPublisher};
use crate::handler::{HandlerRegistry, JobDispatcher};
use crate::store::Store;

use super::orchestrator::JobRuntime;

/// Builder for a [`JobRuntime`] with explicit dependencies.
///
/// The store and the dispatcher are required. Events default to an
/// in-process bus sized by the config, the clock to [`SystemClock`].
///
/// # Example
///
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register("send_email", SendEmail);
///
/// let runtime = JobRuntimeBuilder::new(RuntimeConfig::default())
///     .with_store(store)
///     .with_registry(registry)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct JobRuntimeBuilder<S, D = HandlerRegistry> {
    config: RuntimeConfig,
    store: Option<Arc<S>>,
    dispatcher: Option<Arc<D>>,
    events: Option<Arc<dyn JobEventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<S, D> fmt::Debug for JobRuntimeBuilder<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("JobRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("dispatcher_set", &self.dispatcher.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("clock_set", &self.clock.is_some());

        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.dispatcher.is_some() {
            debug.field("dispatcher_type", &type_name::<D>());
        }

        debug.finish()
    }
}

impl<S, D> JobRuntimeBuilder<S, D>
where
    S: Store,
    D: JobDispatcher + 'static,
{
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            store: None,
            dispatcher: None,
            events: None,
            clock: None,
        }
    }

    /// Set the runtime configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the job store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the dispatcher that runs leased jobs.
    pub fn with_dispatcher(mut self, dispatcher: Arc<D>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the clock used by background tasks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the store or dispatcher is missing, or the
    /// worker configuration subscribes to no queue while workers are
    /// requested.
    pub fn build(self) -> anyhow::Result<JobRuntime<S, D>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("dispatcher dependency missing"))?;
        if self.config.worker_parallelism > 0 && self.config.worker.queues.is_empty() {
            anyhow::bail!("worker configuration lists no queues");
        }
        let events: Arc<dyn JobEventPublisher> = match self.events {
            Some(events) => events,
            None => Arc::new(InProcEventBus::new(self.config.event_capacity)),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        Ok(JobRuntime::new(self.config, store, dispatcher, events, clock))
    }
}

impl<S: Store> JobRuntimeBuilder<S, HandlerRegistry> {
    /// Use a [`HandlerRegistry`] as the dispatcher.
    pub fn with_registry(self, registry: HandlerRegistry) -> Self {
        self.with_dispatcher(Arc::new(registry))
    }
}
