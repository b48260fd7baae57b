//! Jobyard - persistent job queue and worker scheduler.
//!
//! Producers enqueue jobs into named queues. Worker loops, possibly spread
//! over many processes, lease jobs one at a time from a shared store, run
//! the registered handler and record the outcome. Failed attempts are
//! retried after a per-queue delay until their attempts run out.
//!
//! # Core Concepts
//!
//! - **Job**: A persisted unit of work ([`Job`]) with a status lifecycle
//!   driven by typed [`StatusUpdate`]s.
//!
//! - **Store**: The [`JobStore`], [`WorkerRegistry`] and [`RecurringJobStore`]
//!   traits abstract the backend. Leasing is atomic in every backend; the
//!   store is the only state shared between processes.
//!
//! - **Handlers**: A [`HandlerRegistry`] maps job types to typed
//!   [`JobHandler`]s or closures. Panics are contained per job.
//!
//! - **Runtime**: The [`JobRuntime`] runs worker loops, the supervisor, the
//!   recurring scheduler and the cleanup task until shut down.
//!
//! - **Service**: [`JobService`] is the programmatic surface for producers
//!   and operators.
//!
//! - **Events**: Lifecycle events are broadcast on an [`InProcEventBus`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use jobyard::*;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("send_email", |payload, ctx| async move {
//!     ctx.update_progress(50, None).await?;
//!     Ok(serde_json::json!({ "sent": payload["to"] }))
//! });
//!
//! let runtime = JobRuntimeBuilder::new(RuntimeConfig::default())
//!     .with_store(store)
//!     .with_registry(registry)
//!     .build()?;
//! runtime.start().await?;
//! runtime
//!     .service()
//!     .create_job(None, "default", "send_email", payload, JobOptions::default())
//!     .await?;
//! ```

/// Injectable time source.
pub mod clock;

/// Configuration structures for persistence and the runtime tasks.
pub mod config;

/// Error type returned across the library boundary.
pub mod error;

/// Lifecycle events and the in-process event bus.
pub mod events;

/// Handler registration, execution context and dispatch.
pub mod handler;

/// Jobs, status transitions, creation options and logs.
pub mod job;

/// Lease types and the eligibility and ordering rules of the leasing engine.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Per-queue policy: concurrency, retry delay, attempts, timeout, pause.
pub mod queue;

/// Recurring job definitions and schedule evaluation.
pub mod recurring;

/// Retry policy applied to failed attempts.
pub mod retry;

/// Runtime orchestration: worker loops, supervisor, cleanup, shutdown.
pub mod runtime;

/// Recurring job firing.
pub mod scheduler;

/// Programmatic service API.
pub mod service;

/// Queue statistics and time-bucketed metrics.
pub mod stats;

/// Storage traits implemented by every backend.
pub mod store;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

/// Worker registration records.
pub mod workers;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
pub mod persistence;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use handler::*;
pub use job::*;
pub use lease::*;
pub use queue::*;
pub use recurring::*;
pub use retry::*;
pub use runtime::*;
pub use scheduler::*;
pub use service::*;
pub use stats::*;
pub use store::*;
pub use workers::*;
