//! Task result providers
//!
//! A provider turns a task id into a content hash of its result. Failures
//! are a normal outcome: the task is simply absent from this agent's payload.

use async_trait::async_trait;
use mech_consensus::{ResultHash, TaskId};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    #[error("provider unavailable for {task_id}: {reason}")]
    Unavailable { task_id: TaskId, reason: String },

    #[error("task {task_id} exceeded its {after_ms} ms deadline")]
    Timeout { task_id: TaskId, after_ms: u64 },

    #[error("task {task_id} timed out {timeouts} times and will not be retried")]
    TimeoutLimitReached { task_id: TaskId, timeouts: u32 },

    #[error("task {0} produced an empty result")]
    EmptyResult(TaskId),
}

/// Executes a task and returns the content hash of its result
#[async_trait]
pub trait TaskResultProvider: Send + Sync {
    async fn execute(&self, task_id: &TaskId) -> Result<ResultHash, ProviderFailure>;
}

/// Deterministic provider: every agent with the same namespace agrees
#[derive(Debug, Clone)]
pub struct HashingProvider {
    namespace: String,
}

impl HashingProvider {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl TaskResultProvider for HashingProvider {
    async fn execute(&self, task_id: &TaskId) -> Result<ResultHash, ProviderFailure> {
        let content = format!("{}/{}", self.namespace, task_id);
        Ok(ResultHash::of_content(content.as_bytes()))
    }
}

/// Wraps a provider and fails a fraction of calls, like a flaky web service
pub struct FlakyProvider {
    inner: Arc<dyn TaskResultProvider>,
    failure_rate: f64,
}

impl FlakyProvider {
    pub fn new(inner: Arc<dyn TaskResultProvider>, failure_rate: f64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl TaskResultProvider for FlakyProvider {
    async fn execute(&self, task_id: &TaskId) -> Result<ResultHash, ProviderFailure> {
        let fail = rand::thread_rng().gen_bool(self.failure_rate);
        if fail {
            return Err(ProviderFailure::Unavailable {
                task_id: task_id.clone(),
                reason: "upstream request failed".into(),
            });
        }
        self.inner.execute(task_id).await
    }
}
