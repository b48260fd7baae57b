//! Handler registration and dispatch.
//!
//! Handlers are looked up by `job_type` once per leased job. A job type
//! with no registered handler fails like any other handler error and goes
//! through the normal retry path.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::error::Result;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{JobId, LogLevel};
use crate::lease::JobLease;
use crate::store::JobStore;

/// Failure reported by a handler.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        let chain: Vec<String> =
            err.chain().skip(1).map(|cause| cause.to_string()).collect();
        Self {
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// What a handler sees besides its payload.
#[derive(Clone)]
pub struct ExecutionContext {
    job_id: JobId,
    job_type: String,
    queue_name: String,
    worker_id: String,
    attempt: i32,
    timeout: Duration,
    store: Arc<dyn JobStore>,
    events: Arc<dyn JobEventPublisher>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("queue_name", &self.queue_name)
            .field("worker_id", &self.worker_id)
            .field("attempt", &self.attempt)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(
        lease: &JobLease,
        timeout: Duration,
        store: Arc<dyn JobStore>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            job_id: lease.job.id,
            job_type: lease.job.job_type.clone(),
            queue_name: lease.job.queue_name.clone(),
            worker_id: lease.worker_id.clone(),
            attempt: lease.attempt(),
            timeout,
            store,
            events,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    /// Advisory execution budget. The runtime logs overruns but does not
    /// interrupt the handler.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record progress (clamped to 100) with optional detail.
    pub async fn update_progress(
        &self,
        percent: u8,
        data: Option<Value>,
    ) -> Result<()> {
        let progress = percent.min(100);
        self.store
            .update_progress(self.job_id, &self.worker_id, progress, data)
            .await?;
        let event = JobEvent::new(JobEventPayload::Progress {
            job_id: self.job_id,
            progress,
        });
        if let Err(err) = self.events.publish(event).await {
            tracing::warn!("publish progress event failed: {err}");
        }
        Ok(())
    }

    /// Attach a log entry to the job.
    pub async fn log(
        &self,
        level: LogLevel,
        message: impl AsRef<str>,
        details: Option<Value>,
    ) -> Result<()> {
        let message = message.as_ref();
        tracing::debug!(
            job_id = %self.job_id,
            level = level.as_str(),
            "{message}"
        );
        self.store
            .append_log(self.job_id, level, message, details)
            .await
    }
}

/// A handler for one job type with a typed payload.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send;

    async fn handle(
        &self,
        payload: Self::Payload,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, HandlerError>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn call(
        &self,
        payload: Value,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, HandlerError>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> ErasedHandler for Typed<H> {
    async fn call(
        &self,
        payload: Value,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, HandlerError> {
        let payload: H::Payload =
            serde_json::from_value(payload).map_err(|err| {
                HandlerError::new(format!(
                    "invalid payload for job type {}: {err}",
                    ctx.job_type()
                ))
            })?;
        self.0.handle(payload, ctx).await
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ErasedHandler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>>
        + Send
        + 'static,
{
    async fn call(
        &self,
        payload: Value,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, HandlerError> {
        (self.0)(payload, ctx.clone()).await
    }
}

/// Result of running one leased job.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchStatus {
    /// Handler returned normally.
    Success { result: Option<Value> },
    /// Handler failed, panicked, or no handler exists.
    Failure { error: HandlerError },
}

/// Runs leased jobs. Implemented by [`HandlerRegistry`]; tests substitute
/// their own.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        lease: &JobLease,
        ctx: ExecutionContext,
    ) -> DispatchStatus;
}

/// Process-local map from job type to handler, built at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler, replacing any previous one for the type.
    pub fn register<H: JobHandler>(
        &mut self,
        job_type: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        self.handlers
            .insert(job_type.into(), Arc::new(Typed(handler)));
        self
    }

    /// Register a closure taking the raw JSON payload.
    pub fn register_fn<F, Fut>(
        &mut self,
        job_type: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>>
            + Send
            + 'static,
    {
        self.handlers
            .insert(job_type.into(), Arc::new(FnHandler(handler)));
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> =
            self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl JobDispatcher for HandlerRegistry {
    async fn dispatch(
        &self,
        lease: &JobLease,
        ctx: ExecutionContext,
    ) -> DispatchStatus {
        let Some(handler) = self.handlers.get(&lease.job.job_type).cloned()
        else {
            return DispatchStatus::Failure {
                error: HandlerError::new(format!(
                    "no handler registered for job type {}",
                    lease.job.job_type
                )),
            };
        };

        let payload = lease.job.payload.clone();
        let outcome = AssertUnwindSafe(async move {
            handler.call(payload, &ctx).await
        })
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(Value::Null)) => DispatchStatus::Success { result: None },
            Ok(Ok(result)) => DispatchStatus::Success {
                result: Some(result),
            },
            Ok(Err(error)) => DispatchStatus::Failure { error },
            Err(panic) => DispatchStatus::Failure {
                error: HandlerError::new(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
