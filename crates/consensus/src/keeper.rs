//! Keeper election
//!
//! A pure function of (round id, participant set, failed keepers), so every
//! agent elects the same keeper without exchanging messages.

use crate::types::{ParticipantId, ParticipantSet, RoundId};
use std::collections::BTreeSet;

/// An elected keeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperChoice {
    pub keeper: ParticipantId,
    /// Every candidate had failed, so the exclusion set must be cleared
    pub cycle_reset: bool,
}

/// Round-robin keeper rotation over rank order
#[derive(Debug, Clone, Copy, Default)]
pub struct KeeperSelector;

impl KeeperSelector {
    pub fn new() -> Self {
        Self
    }

    /// Elect the keeper for an attempt.
    ///
    /// Starts at `round_id mod n` in rank order and walks forward, skipping
    /// participants in `prior_failed`. Live participants are preferred when
    /// at least one is live. Returns `None` only for an empty set.
    pub fn select(
        &self,
        round_id: RoundId,
        participants: &ParticipantSet,
        prior_failed: &BTreeSet<ParticipantId>,
    ) -> Option<KeeperChoice> {
        let ordered = participants.ordered();
        if ordered.is_empty() {
            return None;
        }

        let n = ordered.len();
        let start = (round_id % n as u64) as usize;
        let any_live = ordered.iter().any(|p| p.live);

        let rotation = (0..n)
            .map(|offset| &ordered[(start + offset) % n])
            .filter(|p| p.live || !any_live);

        let mut first_candidate = None;
        for candidate in rotation {
            if first_candidate.is_none() {
                first_candidate = Some(candidate);
            }
            if !prior_failed.contains(&candidate.id) {
                return Some(KeeperChoice {
                    keeper: candidate.id.clone(),
                    cycle_reset: false,
                });
            }
        }

        // Full rotation without a usable keeper
        first_candidate.map(|p| KeeperChoice {
            keeper: p.id.clone(),
            cycle_reset: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Participant;

    fn group(n: usize) -> ParticipantSet {
        ParticipantSet::new(
            (0..n)
                .map(|i| Participant::new(format!("agent-{}", i), i as u32))
                .collect(),
        )
    }

    fn excluded(ids: &[&str]) -> BTreeSet<ParticipantId> {
        ids.iter().map(|id| ParticipantId::from(*id)).collect()
    }

    #[test]
    fn test_round_seeds_start() {
        let participants = group(4);
        let selector = KeeperSelector::new();

        let keeper = |round| selector.select(round, &participants, &BTreeSet::new()).unwrap().keeper;
        assert_eq!(keeper(0), ParticipantId::from("agent-0"));
        assert_eq!(keeper(1), ParticipantId::from("agent-1"));
        assert_eq!(keeper(5), ParticipantId::from("agent-1"));
    }

    #[test]
    fn test_skips_failed_keepers() {
        let participants = group(4);
        let choice = KeeperSelector::new()
            .select(2, &participants, &excluded(&["agent-2", "agent-3"]))
            .unwrap();
        assert_eq!(choice.keeper, ParticipantId::from("agent-0"));
        assert!(!choice.cycle_reset);
    }

    #[test]
    fn test_full_rotation_resets() {
        let participants = group(3);
        let choice = KeeperSelector::new()
            .select(1, &participants, &excluded(&["agent-0", "agent-1", "agent-2"]))
            .unwrap();
        assert_eq!(choice.keeper, ParticipantId::from("agent-1"));
        assert!(choice.cycle_reset);
    }

    #[test]
    fn test_no_repeat_within_cycle() {
        let participants = group(5);
        let selector = KeeperSelector::new();
        let mut failed = BTreeSet::new();
        let mut seen = Vec::new();

        for _ in 0..5 {
            let choice = selector.select(3, &participants, &failed).unwrap();
            assert!(!choice.cycle_reset);
            assert!(!seen.contains(&choice.keeper));
            seen.push(choice.keeper.clone());
            failed.insert(choice.keeper);
        }

        assert!(selector.select(3, &participants, &failed).unwrap().cycle_reset);
    }

    #[test]
    fn test_prefers_live_participants() {
        let mut participants = group(4);
        participants.set_live(&ParticipantId::from("agent-0"), false);

        let choice = KeeperSelector::new().select(0, &participants, &BTreeSet::new()).unwrap();
        assert_eq!(choice.keeper, ParticipantId::from("agent-1"));

        for id in ["agent-1", "agent-2", "agent-3"] {
            participants.set_live(&ParticipantId::from(id), false);
        }
        let choice = KeeperSelector::new().select(0, &participants, &BTreeSet::new()).unwrap();
        assert_eq!(choice.keeper, ParticipantId::from("agent-0"));
    }

    #[test]
    fn test_empty_set() {
        assert!(KeeperSelector::new()
            .select(0, &ParticipantSet::default(), &BTreeSet::new())
            .is_none());
    }
}
