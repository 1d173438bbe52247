//! Batched settlement transaction
//!
//! One transaction carries every resolved task of a round, so an outcome
//! costs exactly one ledger write.

use borsh::{BorshDeserialize, BorshSerialize};
use mech_consensus::{Outcome, OutcomeHash, ParticipantId, ResultHash, RoundId, TaskId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SettlementTx {
    pub round_id: RoundId,
    pub attempt_number: u32,
    /// Keeper that assembled and signs the transaction
    pub keeper: ParticipantId,
    pub outcome_hash: OutcomeHash,
    /// Resolved tasks in canonical order
    pub entries: Vec<(TaskId, ResultHash)>,
}

impl SettlementTx {
    pub fn from_outcome(round_id: RoundId, attempt_number: u32, keeper: ParticipantId, outcome: &Outcome) -> Self {
        Self {
            round_id,
            attempt_number,
            keeper,
            outcome_hash: outcome.hash(),
            entries: outcome
                .merged
                .iter()
                .map(|(task, result)| (task.clone(), result.clone()))
                .collect(),
        }
    }

    /// Recompute the outcome hash from the carried entries
    pub fn recomputed_hash(&self) -> OutcomeHash {
        let merged: BTreeMap<TaskId, ResultHash> = self.entries.iter().cloned().collect();
        Outcome {
            merged,
            agreeing_participants: Default::default(),
            quorum_size: 0,
        }
        .hash()
    }

    /// Check the transaction is internally consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.entries.is_empty() {
            return Err("settlement carries no tasks".into());
        }
        if self.entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err("entries are not in canonical task order".into());
        }
        if self.recomputed_hash() != self.outcome_hash {
            return Err(format!("outcome hash {} does not match entries", self.outcome_hash));
        }
        Ok(())
    }

    /// Serialize to calldata
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("SettlementTx serialization should not fail")
    }

    /// Deserialize from calldata
    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}
