//! Status handlers, independent of the HTTP layer

use agent_runtime::status::CheckpointView;
use agent_runtime::{AgentStatus, SharedStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Context shared across handlers
pub struct StatusContext {
    pub status: SharedStatus,
    pub health_threshold_secs: i64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("no round has been finalized yet")]
    NoCheckpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub is_healthy: bool,
    pub seconds_since_progress: i64,
    pub health_threshold_secs: i64,
    pub round_id: u64,
    pub phase: String,
    pub finalized_rounds: u64,
    /// Last task the provider answered, with its unix timestamp
    pub last_executed_task: Option<(String, i64)>,
}

/// Healthy while rounds keep finalizing within the threshold
pub fn handle_healthcheck(ctx: &StatusContext, now: i64) -> HealthResponse {
    let status = ctx.status.read();
    let seconds_since_progress = status.seconds_since_progress(now);

    HealthResponse {
        is_healthy: seconds_since_progress <= ctx.health_threshold_secs,
        seconds_since_progress,
        health_threshold_secs: ctx.health_threshold_secs,
        round_id: status.round_id,
        phase: status.phase.clone(),
        finalized_rounds: status.finalized_rounds,
        last_executed_task: status.last_executed_task.clone(),
    }
}

pub fn handle_status(ctx: &StatusContext) -> AgentStatus {
    ctx.status.read().clone()
}

pub fn handle_checkpoint(ctx: &StatusContext) -> Result<CheckpointView, StatusError> {
    ctx.status
        .read()
        .last_checkpoint
        .clone()
        .ok_or(StatusError::NoCheckpoint)
}
