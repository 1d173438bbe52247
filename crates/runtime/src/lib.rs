//! Agent Runtime - Drives a RoundStateMachine against real collaborators
//!
//! This crate provides the moving parts around the pure protocol core:
//! - Task execution against a TaskResultProvider with deadlines and requeue
//! - An in-process replication bus with total-order delivery
//! - Checkpoint persistence (sled) for restart without double settlement
//! - The per-agent event loop executing state machine actions

pub mod agent;
pub mod persistence;
pub mod provider;
pub mod replication;
pub mod status;
pub mod task_runner;

#[cfg(test)]
mod tests;

pub use agent::{Agent, AgentBuilder};
pub use persistence::{CheckpointStore, MemoryCheckpointStore, SledCheckpointStore};
pub use provider::{FlakyProvider, HashingProvider, ProviderFailure, TaskResultProvider};
pub use replication::{Delivery, DeliveryReceiver, LocalBus, Replication};
pub use status::{AgentStatus, SharedStatus};
pub use task_runner::{request_queue, RunReport, TaskReceiver, TaskRunner, TaskRunnerConfig, TaskSender};

/// Event loop tick in milliseconds
pub const TICK_INTERVAL_MS: u64 = 50;

/// Capacity of the incoming task request queue
pub const REQUEST_QUEUE_CAPACITY: usize = 1024;
