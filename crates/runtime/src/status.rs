//! Agent status snapshot shared with the status surface

use mech_consensus::{Checkpoint, ParticipantId, RoundId, RoundKind, RoundStateMachine, TaskId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type SharedStatus = Arc<RwLock<AgentStatus>>;

/// Last finalized checkpoint, in display form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointView {
    pub round_id: RoundId,
    pub outcome_hash: String,
    pub settlement_tx: Option<String>,
}

impl From<&Checkpoint> for CheckpointView {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            round_id: checkpoint.last_finalized_round_id,
            outcome_hash: checkpoint.last_outcome_hash.to_string(),
            settlement_tx: checkpoint.settlement_tx.as_ref().map(|tx| tx.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub participant: String,
    pub round_id: RoundId,
    pub phase: String,
    pub keeper: Option<String>,
    pub attempt_number: Option<u32>,
    pub substrate_height: u64,
    pub pending_tasks: usize,
    pub last_checkpoint: Option<CheckpointView>,
    /// Unix timestamp of startup
    pub started_at: i64,
    /// Unix timestamp of the last finalized round
    pub last_finalized_at: Option<i64>,
    pub finalized_rounds: u64,
    pub skipped_resubmissions: u64,
    pub abandoned_rounds: u64,
    pub provider_failures: u64,
    pub last_executed_task: Option<(String, i64)>,
}

impl AgentStatus {
    pub fn new(participant: &ParticipantId) -> Self {
        Self {
            participant: participant.to_string(),
            phase: RoundKind::Collect.to_string(),
            started_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    /// Refresh the fields mirrored from the state machine
    pub fn observe(&mut self, machine: &RoundStateMachine) {
        self.round_id = machine.round_id();
        self.phase = machine.kind().to_string();
        self.keeper = machine.current_keeper().map(|k| k.to_string());
        self.attempt_number = match machine.kind() {
            RoundKind::Settle => machine.attempts().last().map(|a| a.attempt_number),
            _ => None,
        };
        self.pending_tasks = machine.pending().len() + machine.round().payloads.batch().len();
        self.last_checkpoint = machine.checkpoint().map(CheckpointView::from);
    }

    pub fn record_executed(&mut self, task_id: &TaskId) {
        self.last_executed_task = Some((task_id.to_string(), chrono::Utc::now().timestamp()));
    }

    /// Seconds since the agent last made progress (finalized a round, or started)
    pub fn seconds_since_progress(&self, now: i64) -> i64 {
        now - self.last_finalized_at.unwrap_or(self.started_at)
    }
}
