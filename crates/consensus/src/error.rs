//! Consensus Errors

use crate::types::{ParticipantId, RoundId, TaskId};
use thiserror::Error;

/// Errors raised by the protocol core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("{participant} already submitted {task_id} in round {round_id}")]
    DuplicateSubmission {
        participant: ParticipantId,
        task_id: TaskId,
        round_id: RoundId,
    },

    #[error("payload for round {got} is stale (current round {current})")]
    StalePayload { current: RoundId, got: RoundId },

    #[error("empty result hash from {participant} for {task_id}")]
    EmptyResultHash {
        participant: ParticipantId,
        task_id: TaskId,
    },

    #[error("task {0} is not part of the current batch")]
    UnknownTask(TaskId),

    #[error("participant {0} is not part of the group")]
    UnknownParticipant(ParticipantId),

    #[error("bundle from {sender} carries a payload signed as {participant}")]
    SenderMismatch {
        sender: ParticipantId,
        participant: ParticipantId,
    },

    #[error("settlement notice for round {round_id} refused: {reason}")]
    NoticeMismatch { round_id: RoundId, reason: String },

    #[error("round {0} resolved no task")]
    UnresolvedOutcome(RoundId),

    #[error("keeper {keeper} timed out on attempt {attempt_number}")]
    KeeperTimeout {
        keeper: ParticipantId,
        attempt_number: u32,
    },

    #[error("settlement rejected: {0}")]
    SettlementRejected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsensusError {
    /// Local errors that are logged and ignored without affecting the round
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConsensusError::DuplicateSubmission { .. }
                | ConsensusError::StalePayload { .. }
                | ConsensusError::EmptyResultHash { .. }
                | ConsensusError::UnknownTask(_)
                | ConsensusError::UnknownParticipant(_)
                | ConsensusError::SenderMismatch { .. }
                | ConsensusError::NoticeMismatch { .. }
        )
    }

    /// Errors the state machine recovers from with a bounded retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConsensusError::UnresolvedOutcome(_) | ConsensusError::KeeperTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
