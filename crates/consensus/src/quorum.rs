//! Quorum evaluation and deterministic outcome merge
//!
//! Every agent runs the merge independently over the same delivered payloads,
//! so the result must not depend on arrival order. All grouping goes through
//! ordered maps for that reason.

use crate::config::QuorumPolicy;
use crate::payload_store::PayloadStore;
use crate::types::{Outcome, ParticipantId, ParticipantSet, ResultHash, TaskId};
use std::collections::{BTreeMap, BTreeSet};

/// Result of merging a round's payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub outcome: Outcome,
    /// Batch tasks that did not resolve, to be retried next round
    pub unresolved: BTreeSet<TaskId>,
}

/// Decides when a round has agreement and what the agreement is
#[derive(Debug, Clone, Copy, Default)]
pub struct QuorumEvaluator {
    policy: QuorumPolicy,
}

impl QuorumEvaluator {
    pub fn new(policy: QuorumPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    pub fn quorum_size(&self, participants: &ParticipantSet) -> usize {
        self.policy.threshold(participants.len())
    }

    /// True once enough distinct group members have submitted
    pub fn is_quorum_reached(&self, store: &PayloadStore, participants: &ParticipantSet) -> bool {
        let submitted = store
            .submitters()
            .iter()
            .filter(|p| participants.contains(p))
            .count();
        submitted >= self.quorum_size(participants)
    }

    /// Merge the round's payloads into an outcome.
    ///
    /// A task resolves to its most reported hash when that hash has quorum
    /// support and a strict majority of the task's reporters. Anything else,
    /// including a task nobody reported, is unresolved.
    pub fn merge(&self, store: &PayloadStore, participants: &ParticipantSet) -> MergeOutcome {
        let quorum_size = self.quorum_size(participants);

        let mut reports: BTreeMap<&TaskId, BTreeMap<&ResultHash, BTreeSet<&ParticipantId>>> = BTreeMap::new();
        for payload in store.get_all() {
            if !participants.contains(&payload.participant) {
                continue;
            }
            reports
                .entry(&payload.task_id)
                .or_default()
                .entry(&payload.result_hash)
                .or_default()
                .insert(&payload.participant);
        }

        let mut merged = BTreeMap::new();
        let mut agreeing = BTreeSet::new();
        let mut unresolved = BTreeSet::new();

        for task_id in store.batch() {
            let Some(by_hash) = reports.get(task_id) else {
                unresolved.insert(task_id.clone());
                continue;
            };

            let reporters: usize = by_hash.values().map(|s| s.len()).sum();
            // max_by_key keeps the last maximum; ties never resolve anyway
            let (hash, backers) = match by_hash.iter().max_by_key(|(_, backers)| backers.len()) {
                Some(best) => best,
                None => {
                    unresolved.insert(task_id.clone());
                    continue;
                }
            };

            let support = backers.len();
            if support >= quorum_size && 2 * support > reporters {
                merged.insert(task_id.clone(), (*hash).clone());
                agreeing.extend(backers.iter().map(|p| (*p).clone()));
            } else {
                tracing::debug!(
                    "Task {} unresolved: best support {}/{} reporters, quorum {}",
                    task_id,
                    support,
                    reporters,
                    quorum_size
                );
                unresolved.insert(task_id.clone());
            }
        }

        MergeOutcome {
            outcome: Outcome {
                merged,
                agreeing_participants: agreeing,
                quorum_size,
            },
            unresolved,
        }
    }
}
