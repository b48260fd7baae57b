use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::events::JobEventPublisher;
use crate::handler::JobDispatcher;
use crate::scheduler::RecurringScheduler;
use crate::service::JobService;
use crate::store::Store;

use super::cleanup::CleanupTask;
use super::shutdown::ShutdownToken;
use super::supervisor::Supervisor;
use super::worker::{WorkerConfig, WorkerLoop};

/// Owns the background tasks of one process: worker loops, supervisor,
/// recurring scheduler and cleanup.
pub struct JobRuntime<S, D> {
    config: RuntimeConfig,
    store: Arc<S>,
    dispatcher: Arc<D>,
    events: Arc<dyn JobEventPublisher>,
    clock: Arc<dyn Clock>,
    shutdown_token: ShutdownToken,
    started: AtomicBool,
    task_handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl<S, D> fmt::Debug for JobRuntime<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .task_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("JobRuntime")
            .field("config", &self.config)
            .field("store_type", &type_name::<S>())
            .field("dispatcher_type", &type_name::<D>())
            .field("clock", &self.clock)
            .field("task_count", &task_count)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<S, D> JobRuntime<S, D>
where
    S: Store,
    D: JobDispatcher + 'static,
{
    pub fn new(
        config: RuntimeConfig,
        store: Arc<S>,
        dispatcher: Arc<D>,
        events: Arc<dyn JobEventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            events,
            clock,
            shutdown_token: ShutdownToken::new(),
            started: AtomicBool::new(false),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn dispatcher(&self) -> Arc<D> {
        Arc::clone(&self.dispatcher)
    }

    pub fn events(&self) -> Arc<dyn JobEventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// A service sharing this runtime's store, events and clock.
    pub fn service(&self) -> JobService<S> {
        JobService::new(self.store(), self.events(), Arc::clone(&self.clock))
    }

    pub fn scheduler(&self) -> RecurringScheduler<S> {
        RecurringScheduler::new(
            self.store(),
            self.events(),
            Arc::clone(&self.clock),
            self.config.scheduler.clone(),
        )
    }

    /// Spawn every task enabled by the configuration. A runtime starts at
    /// most once.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("runtime already shut down");
        }
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("runtime already started");
        }
        let worker_config = self.config.worker.clone();
        self.spawn_workers(worker_config, self.config.worker_parallelism)
            .await;
        self.spawn_supervisor().await;
        self.spawn_scheduler().await;
        self.spawn_cleanup().await;
        tracing::info!(
            workers = self.config.worker_parallelism,
            "job runtime started"
        );
        Ok(())
    }

    /// Spawn `parallelism` worker loops; returns their ids.
    pub async fn spawn_workers(
        &self,
        config: WorkerConfig,
        parallelism: usize,
    ) -> Vec<String> {
        let mut ids = Vec::with_capacity(parallelism);
        let mut handles = self.task_handles.lock().await;
        let offset = handles
            .iter()
            .filter(|(name, _)| name.starts_with("worker:"))
            .count();

        for i in 0..parallelism {
            let worker_id = config.worker_id(offset + i);
            let worker = WorkerLoop::new(
                worker_id.clone(),
                config.clone(),
                self.store(),
                self.dispatcher(),
                self.events(),
            );
            let shutdown = self.shutdown_token.clone();
            let handle = tokio::spawn(async move { worker.run(shutdown).await });
            handles.push((format!("worker:{worker_id}"), handle));
            ids.push(worker_id);
        }
        ids
    }

    pub async fn spawn_supervisor(&self) {
        let supervisor = Supervisor::new(
            self.store(),
            self.events(),
            self.config.supervisor.clone(),
        );
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move { supervisor.run(shutdown).await });
        self.task_handles
            .lock()
            .await
            .push(("supervisor".to_string(), handle));
    }

    pub async fn spawn_scheduler(&self) {
        let scheduler = self.scheduler();
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move { scheduler.run(shutdown).await });
        self.task_handles
            .lock()
            .await
            .push(("scheduler".to_string(), handle));
    }

    pub async fn spawn_cleanup(&self) {
        let cleanup = CleanupTask::new(self.store(), self.config.cleanup.clone());
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move { cleanup.run(shutdown).await });
        self.task_handles
            .lock()
            .await
            .push(("cleanup".to_string(), handle));
    }

    /// Signal every task to stop and wait for them, bounded per task by the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("initiating graceful shutdown of job runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.task_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let timeout = self.config.shutdown_timeout();
        for (name, handle) in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = %name, "task failed: {e:?}"),
                Err(_) => {
                    tracing::warn!(task = %name, "task timed out during shutdown")
                }
            }
        }

        tracing::info!("job runtime shutdown complete");
        Ok(())
    }
}
