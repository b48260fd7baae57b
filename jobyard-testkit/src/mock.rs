use std::sync::Arc;

use async_trait::async_trait;
use jobyard::{DispatchStatus, ExecutionContext, JobDispatcher, JobId, JobLease};
use parking_lot::Mutex;

/// Dispatcher returning a preset status for every job.
#[derive(Clone, Debug)]
pub struct MockDispatcher {
    dispatches: Arc<Mutex<Vec<DispatchRecord>>>,
    result: Arc<Mutex<DispatchStatus>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub worker_id: String,
    pub attempt: i32,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::with_result(DispatchStatus::Success { result: None })
    }

    pub fn with_result(result: DispatchStatus) -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            result: Arc::new(Mutex::new(result)),
        }
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatches.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {expected} dispatches, got {actual}"
        );
    }

    pub fn set_result(&self, result: DispatchStatus) {
        *self.result.lock() = result;
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        lease: &JobLease,
        ctx: ExecutionContext,
    ) -> DispatchStatus {
        self.dispatches.lock().push(DispatchRecord {
            job_id: lease.job_id(),
            job_type: lease.job.job_type.clone(),
            worker_id: ctx.worker_id().to_string(),
            attempt: ctx.attempt(),
        });
        self.result.lock().clone()
    }
}
