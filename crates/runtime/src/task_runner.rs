//! Task Runner - executes a round's tasks against the provider
//!
//! Tasks run with bounded parallelism, each under a deadline. A task that
//! overruns its deadline goes to the back of the queue until it has timed
//! out `timeout_limit` times.

use crate::provider::{ProviderFailure, TaskResultProvider};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use mech_consensus::{ParticipantId, PayloadBundle, RoundId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Upper bound on how much a full queue shortens the deadline
const MAX_DEADLINE_SHRINK: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunnerConfig {
    /// Deadline for a single task when the queue is not congested
    pub task_deadline_ms: u64,
    /// Queue length above which deadlines shrink
    pub max_queue_size: usize,
    /// Tasks executing at the same time
    pub max_executing_tasks: usize,
    /// Timeouts after which a task is reported as failed
    pub timeout_limit: u32,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            task_deadline_ms: 240_000,
            max_queue_size: 20,
            max_executing_tasks: 4,
            timeout_limit: 3,
        }
    }
}

impl TaskRunnerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.task_deadline_ms == 0 {
            anyhow::bail!("task_deadline must be positive");
        }
        if self.max_queue_size == 0 || self.max_executing_tasks == 0 || self.timeout_limit == 0 {
            anyhow::bail!("max_queue_size, max_executing_tasks and timeout_limit must be at least 1");
        }
        Ok(())
    }

    /// Deadline for the next task given the current queue length
    pub fn deadline_for(&self, queue_len: usize) -> Duration {
        let base = Duration::from_millis(self.task_deadline_ms);
        if queue_len <= self.max_queue_size {
            return base;
        }
        let shrink = (queue_len as f64 / self.max_queue_size as f64).min(MAX_DEADLINE_SHRINK);
        base.div_f64(shrink)
    }
}

/// Handle for submitting task requests to an agent
#[derive(Clone)]
pub struct TaskSender {
    sender: Sender<TaskId>,
}

impl TaskSender {
    /// Queue a task request
    pub fn send(&self, task_id: TaskId) -> Result<(), String> {
        self.sender
            .try_send(task_id)
            .map_err(|e| format!("Failed to queue task request: {}", e))
    }
}

/// Receiving side of the request queue
pub struct TaskReceiver {
    receiver: Receiver<TaskId>,
}

impl TaskReceiver {
    /// Take up to `max` queued requests without waiting
    pub fn drain(&self, max: usize) -> Vec<TaskId> {
        let mut tasks = Vec::new();
        while tasks.len() < max {
            match self.receiver.try_recv() {
                Ok(task) => tasks.push(task),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("Task request channel disconnected");
                    break;
                }
            }
        }
        tasks
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Create a bounded request queue
pub fn request_queue(capacity: usize) -> (TaskSender, TaskReceiver) {
    let (sender, receiver) = bounded(capacity);
    (TaskSender { sender }, TaskReceiver { receiver })
}

/// Result of executing a round's tasks
#[derive(Debug, Clone)]
pub struct RunReport {
    pub bundle: PayloadBundle,
    pub failures: Vec<ProviderFailure>,
    /// Deadline overruns, including those that were requeued
    pub timeouts: u32,
}

pub struct TaskRunner {
    config: TaskRunnerConfig,
    provider: Arc<dyn TaskResultProvider>,
}

impl TaskRunner {
    pub fn new(config: TaskRunnerConfig, provider: Arc<dyn TaskResultProvider>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &TaskRunnerConfig {
        &self.config
    }

    /// Execute `tasks` and collect the results into a bundle for `round_id`
    pub async fn run(&self, round_id: RoundId, sender: ParticipantId, tasks: Vec<TaskId>) -> RunReport {
        let mut queue: VecDeque<TaskId> = tasks.into();
        let mut timeout_counts: HashMap<TaskId, u32> = HashMap::new();
        let mut executing = JoinSet::new();
        let mut report = RunReport {
            bundle: PayloadBundle::new(round_id, sender),
            failures: Vec::new(),
            timeouts: 0,
        };

        loop {
            while executing.len() < self.config.max_executing_tasks {
                let Some(task_id) = queue.pop_front() else {
                    break;
                };
                let deadline = self.config.deadline_for(queue.len() + 1);
                let provider = self.provider.clone();
                executing.spawn(async move {
                    let result = tokio::time::timeout(deadline, provider.execute(&task_id)).await;
                    (task_id, deadline, result)
                });
            }

            let Some(joined) = executing.join_next().await else {
                break;
            };
            let (task_id, deadline, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Task execution panicked: {}", e);
                    continue;
                }
            };

            match result {
                Ok(Ok(hash)) if hash.is_empty() => {
                    let failure = ProviderFailure::EmptyResult(task_id.clone());
                    tracing::warn!("{}", failure);
                    report.bundle.add_failure(task_id);
                    report.failures.push(failure);
                }
                Ok(Ok(hash)) => {
                    tracing::debug!("Task {} executed: {}", task_id, hash);
                    report.bundle.add_result(task_id, hash);
                }
                Ok(Err(failure)) => {
                    tracing::warn!("Round {}: {}", round_id, failure);
                    report.bundle.add_failure(task_id);
                    report.failures.push(failure);
                }
                Err(_) => {
                    report.timeouts += 1;
                    let count = timeout_counts.entry(task_id.clone()).or_insert(0);
                    *count += 1;
                    tracing::info!(
                        "{}",
                        ProviderFailure::Timeout {
                            task_id: task_id.clone(),
                            after_ms: deadline.as_millis() as u64,
                        }
                    );

                    if *count < self.config.timeout_limit {
                        tracing::info!("Adding task {} to the end of the queue", task_id);
                        queue.push_back(task_id);
                    } else {
                        let failure = ProviderFailure::TimeoutLimitReached {
                            task_id: task_id.clone(),
                            timeouts: *count,
                        };
                        tracing::warn!("{}", failure);
                        report.bundle.add_failure(task_id);
                        report.failures.push(failure);
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::HashingProvider;
    use async_trait::async_trait;
    use mech_consensus::ResultHash;
    use parking_lot::Mutex;

    /// Sleeps longer than any deadline for tasks named "slow*"
    struct SlowProvider {
        calls: Mutex<HashMap<TaskId, u32>>,
    }

    #[async_trait]
    impl TaskResultProvider for SlowProvider {
        async fn execute(&self, task_id: &TaskId) -> Result<ResultHash, ProviderFailure> {
            *self.calls.lock().entry(task_id.clone()).or_insert(0) += 1;
            if task_id.as_str().starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if task_id.as_str().starts_with("fail") {
                return Err(ProviderFailure::Unavailable {
                    task_id: task_id.clone(),
                    reason: "503".into(),
                });
            }
            Ok(ResultHash::of_content(task_id.as_str().as_bytes()))
        }
    }

    fn config() -> TaskRunnerConfig {
        TaskRunnerConfig {
            task_deadline_ms: 50,
            max_queue_size: 10,
            max_executing_tasks: 2,
            timeout_limit: 3,
        }
    }

    #[test]
    fn test_deadline_shrinks_when_congested() {
        let config = TaskRunnerConfig {
            task_deadline_ms: 1_000,
            max_queue_size: 10,
            max_executing_tasks: 1,
            timeout_limit: 1,
        };
        assert_eq!(config.deadline_for(5), Duration::from_millis(1_000));
        assert_eq!(config.deadline_for(10), Duration::from_millis(1_000));
        assert_eq!(config.deadline_for(20), Duration::from_millis(500));
        // Capped at a fifth of the base deadline
        assert_eq!(config.deadline_for(500), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_run_collects_results_and_failures() {
        let runner = TaskRunner::new(config(), Arc::new(HashingProvider::new("mech")));
        let tasks = vec![TaskId::from("a"), TaskId::from("b"), TaskId::from("c")];

        let report = runner.run(7, ParticipantId::from("agent-0"), tasks).await;
        assert_eq!(report.bundle.round_id, 7);
        assert_eq!(report.bundle.payloads.len(), 3);
        assert!(report.failures.is_empty());
        assert!(report
            .bundle
            .payloads
            .iter()
            .all(|p| p.participant == ParticipantId::from("agent-0")));
    }

    #[tokio::test]
    async fn test_timeouts_requeue_until_limit() {
        let provider = Arc::new(SlowProvider {
            calls: Mutex::new(HashMap::new()),
        });
        let runner = TaskRunner::new(config(), provider.clone());
        let tasks = vec![TaskId::from("slow_1"), TaskId::from("fast_1"), TaskId::from("fail_1")];

        let report = runner.run(1, ParticipantId::from("agent-0"), tasks).await;

        assert_eq!(report.bundle.payloads.len(), 1);
        assert_eq!(report.bundle.payloads[0].task_id, TaskId::from("fast_1"));
        assert_eq!(report.timeouts, 3);
        assert_eq!(provider.calls.lock()[&TaskId::from("slow_1")], 3);
        assert!(report.failures.iter().any(|f| matches!(
            f,
            ProviderFailure::TimeoutLimitReached { timeouts: 3, .. }
        )));
        assert!(report
            .bundle
            .failed_tasks
            .contains(&TaskId::from("fail_1")));
        assert_eq!(report.bundle.failed_tasks.len(), 2);
    }

    #[test]
    fn test_request_queue() {
        let (sender, receiver) = request_queue(2);
        sender.send(TaskId::from("a")).unwrap();
        sender.send(TaskId::from("b")).unwrap();
        assert!(sender.send(TaskId::from("c")).is_err());

        assert_eq!(receiver.drain(1), vec![TaskId::from("a")]);
        assert_eq!(receiver.len(), 1);
        assert_eq!(receiver.drain(10), vec![TaskId::from("b")]);
        assert!(receiver.is_empty());
    }
}
