/// Runtime builder for constructing [`JobRuntime`] instances.
pub mod builder;
/// Retention cleanup and gauge refresh task.
pub mod cleanup;
/// The runtime owning all background tasks of a process.
pub mod orchestrator;
/// Graceful shutdown signaling.
pub mod shutdown;
/// Stuck-job and dead-worker repair.
pub mod supervisor;
/// Worker configuration and the worker loop.
pub mod worker;

pub use builder::JobRuntimeBuilder;
pub use cleanup::CleanupTask;
pub use orchestrator::JobRuntime;
pub use shutdown::ShutdownToken;
pub use supervisor::{Supervisor, SweepReport};
pub use worker::{WorkerConfig, WorkerLoop};
