//! Per-round payload log
//!
//! Payloads are appended in arrival order and never removed within a round.

use crate::error::{ConsensusError, Result};
use crate::types::{ParticipantId, PayloadBundle, RoundId, TaskId, TaskPayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Result of applying a bundle to the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleReceipt {
    /// Payloads appended to the log
    pub accepted: usize,
    /// Payloads refused, with the reason
    pub rejected: Vec<ConsensusError>,
}

/// Append-only log of the payloads submitted during one round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadStore {
    round_id: RoundId,
    /// Tasks that may be reported this round
    batch: BTreeSet<TaskId>,
    payloads: Vec<TaskPayload>,
    seen: BTreeSet<(ParticipantId, TaskId)>,
    submitters: BTreeSet<ParticipantId>,
}

impl PayloadStore {
    pub fn new(round_id: RoundId, batch: BTreeSet<TaskId>) -> Self {
        Self {
            round_id,
            batch,
            ..Default::default()
        }
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn batch(&self) -> &BTreeSet<TaskId> {
        &self.batch
    }

    /// Make newly requested tasks reportable in this round
    pub fn admit_tasks<I: IntoIterator<Item = TaskId>>(&mut self, tasks: I) {
        self.batch.extend(tasks);
    }

    /// Append a single payload
    pub fn submit(&mut self, payload: TaskPayload) -> Result<()> {
        if payload.round_id != self.round_id {
            return Err(ConsensusError::StalePayload {
                current: self.round_id,
                got: payload.round_id,
            });
        }
        if payload.result_hash.is_empty() {
            return Err(ConsensusError::EmptyResultHash {
                participant: payload.participant,
                task_id: payload.task_id,
            });
        }
        if !self.batch.contains(&payload.task_id) {
            return Err(ConsensusError::UnknownTask(payload.task_id));
        }

        let key = (payload.participant.clone(), payload.task_id.clone());
        if self.seen.contains(&key) {
            return Err(ConsensusError::DuplicateSubmission {
                participant: key.0,
                task_id: key.1,
                round_id: self.round_id,
            });
        }

        self.seen.insert(key);
        self.submitters.insert(payload.participant.clone());
        self.payloads.push(payload);
        Ok(())
    }

    /// Apply a participant's bundle.
    ///
    /// A bundle for another round is refused as a whole. Otherwise each
    /// payload is validated on its own, and the sender counts as having
    /// submitted even when every payload was refused or the bundle was empty.
    pub fn submit_bundle(&mut self, bundle: PayloadBundle) -> Result<BundleReceipt> {
        if bundle.round_id != self.round_id {
            return Err(ConsensusError::StalePayload {
                current: self.round_id,
                got: bundle.round_id,
            });
        }

        let mut receipt = BundleReceipt::default();
        for payload in bundle.payloads {
            if payload.participant != bundle.sender {
                receipt.rejected.push(ConsensusError::SenderMismatch {
                    sender: bundle.sender.clone(),
                    participant: payload.participant,
                });
                continue;
            }
            match self.submit(payload) {
                Ok(()) => receipt.accepted += 1,
                Err(e) => receipt.rejected.push(e),
            }
        }

        self.submitters.insert(bundle.sender);
        Ok(receipt)
    }

    /// All payloads in arrival order
    pub fn get_all(&self) -> &[TaskPayload] {
        &self.payloads
    }

    pub fn submitters(&self) -> &BTreeSet<ParticipantId> {
        &self.submitters
    }

    pub fn has_submitted(&self, participant: &ParticipantId) -> bool {
        self.submitters.contains(participant)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty() && self.submitters.is_empty()
    }
}
