use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobyard::{ExecutionContext, HandlerError, JobHandler, JobId};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Completes every job and remembers what it saw.
#[derive(Clone, Debug, Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<(JobId, Value)>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(JobId, Value)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    type Payload = Value;

    async fn handle(
        &self,
        payload: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, HandlerError> {
        self.calls.lock().push((ctx.job_id(), payload));
        Ok(json!({ "handled": true }))
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Clone, Debug)]
pub struct FlakyHandler {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    type Payload = Value;

    async fn handle(
        &self,
        _payload: Value,
        _ctx: &ExecutionContext,
    ) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HandlerError::new(format!("transient failure {call}")));
        }
        Ok(json!({ "succeeded_on_call": call }))
    }
}

/// Always fails with the same message.
#[derive(Clone, Debug)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    type Payload = Value;

    async fn handle(
        &self,
        _payload: Value,
        _ctx: &ExecutionContext,
    ) -> Result<Value, HandlerError> {
        Err(HandlerError::new(self.message.clone()).with_stack("at FailingHandler::handle"))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    type Payload = Value;

    async fn handle(
        &self,
        _payload: Value,
        _ctx: &ExecutionContext,
    ) -> Result<Value, HandlerError> {
        panic!("handler exploded");
    }
}

/// Sleeps for a fixed time, then completes.
#[derive(Clone, Copy, Debug)]
pub struct SlowHandler {
    pub delay: Duration,
}

#[async_trait]
impl JobHandler for SlowHandler {
    type Payload = Value;

    async fn handle(
        &self,
        _payload: Value,
        _ctx: &ExecutionContext,
    ) -> Result<Value, HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(Value::Null)
    }
}
