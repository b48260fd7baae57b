//! Maintenance daemon: runs the supervisor, the recurring scheduler and the
//! cleanup task against a PostgreSQL store, without executing jobs.
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/jobyard"
//! export RUST_LOG=jobyard=debug
//! cargo run --bin jobyard-maintd --features postgres
//! ```
//!
//! Set `JOBYARD_LOG_JSON=1` for JSON log lines.

use std::sync::Arc;

use jobyard::persistence::PostgresJobStore;
use jobyard::telemetry::init_tracing;
use jobyard::{
    HandlerRegistry, JobRuntimeBuilder, PersistenceConfig, RuntimeConfig,
    WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let json = std::env::var("JOBYARD_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    init_tracing(json)?;

    let persistence = PersistenceConfig::from_env()?;
    let store = PostgresJobStore::connect(&persistence).await?;
    store.migrate().await?;

    #[cfg(feature = "metrics")]
    jobyard::metrics::init_metrics()?;

    let runtime = JobRuntimeBuilder::new(RuntimeConfig::new(
        WorkerConfig::default(),
        0,
    ))
    .with_store(Arc::new(store))
    .with_registry(HandlerRegistry::new())
    .build()?;

    runtime.start().await?;
    tracing::info!("maintenance daemon running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await?;
    Ok(())
}
