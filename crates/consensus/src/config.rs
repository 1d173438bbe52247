//! Protocol configuration
//!
//! Supplied externally (JSON) and validated once at startup.

use crate::error::{ConsensusError, Result};
use crate::types::{Participant, ParticipantSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default poll interval while waiting for settlement inclusion
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default cap on tasks a participant executes per round
pub const DEFAULT_MAX_TASKS_PER_ROUND: usize = 32;

/// Default number of agreed rounds a task may stay unresolved before it is dropped
pub const DEFAULT_MAX_TASK_ROUNDS: u32 = 3;

/// A group member as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub address: String,
    pub rank: u32,
}

/// Fraction of the participant set whose agreement is binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub numerator: usize,
    pub denominator: usize,
    /// Lower bound on the quorum regardless of group size
    #[serde(default = "default_min_participants")]
    pub min_participants: usize,
}

fn default_min_participants() -> usize {
    1
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        // Standard BFT threshold
        Self {
            numerator: 2,
            denominator: 3,
            min_participants: 1,
        }
    }
}

impl QuorumPolicy {
    /// Quorum size for a group of `n`: ceil(n * numerator / denominator)
    pub fn threshold(&self, n: usize) -> usize {
        let scaled = n * self.numerator;
        let quorum = (scaled + self.denominator - 1) / self.denominator;
        quorum.max(self.min_participants)
    }
}

/// Configuration consumed by the round state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub participants: Vec<ParticipantConfig>,
    /// How long a Collect phase waits before extending
    pub round_timeout_ms: u64,
    /// How long a keeper has to get its settlement included
    pub keeper_timeout_ms: u64,
    /// Keeper rotations allowed after a timeout
    pub keeper_allowed_retries: u32,
    /// Bound on Collect extensions and agreement retries
    pub max_attempts: u32,
    #[serde(default)]
    pub quorum: QuorumPolicy,
    #[serde(default = "default_poll_interval_ms")]
    pub settlement_poll_interval_ms: u64,
    #[serde(default = "default_max_tasks_per_round")]
    pub max_tasks_per_round: usize,
    #[serde(default = "default_max_task_rounds")]
    pub max_task_rounds: u32,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_tasks_per_round() -> usize {
    DEFAULT_MAX_TASKS_PER_ROUND
}

fn default_max_task_rounds() -> u32 {
    DEFAULT_MAX_TASK_ROUNDS
}

impl ProtocolConfig {
    /// Config with default timing for the given addresses, ranked in order
    pub fn for_participants<S: AsRef<str>>(addresses: &[S]) -> Self {
        Self {
            participants: addresses
                .iter()
                .enumerate()
                .map(|(rank, address)| ParticipantConfig {
                    address: address.as_ref().to_string(),
                    rank: rank as u32,
                })
                .collect(),
            round_timeout_ms: 30_000,
            keeper_timeout_ms: 30_000,
            keeper_allowed_retries: 3,
            max_attempts: 3,
            quorum: QuorumPolicy::default(),
            settlement_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_tasks_per_round: DEFAULT_MAX_TASKS_PER_ROUND,
            max_task_rounds: DEFAULT_MAX_TASK_ROUNDS,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConsensusError::InvalidConfig(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the protocol cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(ConsensusError::InvalidConfig("participant set is empty".into()));
        }
        if self.round_timeout_ms == 0 {
            return Err(ConsensusError::InvalidConfig("round_timeout must be positive".into()));
        }
        if self.keeper_timeout_ms == 0 {
            return Err(ConsensusError::InvalidConfig("keeper_timeout must be positive".into()));
        }
        if self.settlement_poll_interval_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "settlement_poll_interval must be positive".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConsensusError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.max_tasks_per_round == 0 {
            return Err(ConsensusError::InvalidConfig(
                "max_tasks_per_round must be at least 1".into(),
            ));
        }
        if self.max_task_rounds == 0 {
            return Err(ConsensusError::InvalidConfig("max_task_rounds must be at least 1".into()));
        }

        let QuorumPolicy {
            numerator,
            denominator,
            ..
        } = self.quorum;
        if numerator == 0 || denominator == 0 || numerator > denominator {
            return Err(ConsensusError::InvalidConfig(format!(
                "quorum fraction {}/{} must be in (0, 1]",
                numerator, denominator
            )));
        }
        if self.quorum.threshold(self.participants.len()) > self.participants.len() {
            return Err(ConsensusError::InvalidConfig(format!(
                "quorum of {} exceeds {} participants",
                self.quorum.threshold(self.participants.len()),
                self.participants.len()
            )));
        }

        let mut addresses = HashSet::new();
        let mut ranks = HashSet::new();
        for p in &self.participants {
            if p.address.is_empty() {
                return Err(ConsensusError::InvalidConfig("participant address is empty".into()));
            }
            if !addresses.insert(p.address.as_str()) {
                return Err(ConsensusError::InvalidConfig(format!(
                    "duplicate participant {}",
                    p.address
                )));
            }
            if !ranks.insert(p.rank) {
                return Err(ConsensusError::InvalidConfig(format!("duplicate rank {}", p.rank)));
            }
        }

        Ok(())
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn keeper_timeout(&self) -> Duration {
        Duration::from_millis(self.keeper_timeout_ms)
    }

    pub fn settlement_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settlement_poll_interval_ms)
    }

    pub fn participant_set(&self) -> ParticipantSet {
        ParticipantSet::new(
            self.participants
                .iter()
                .map(|p| Participant::new(p.address.clone(), p.rank))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bft_threshold() {
        let policy = QuorumPolicy::default();
        assert_eq!(policy.threshold(4), 3);
        assert_eq!(policy.threshold(3), 2);
        assert_eq!(policy.threshold(7), 5);
        assert_eq!(policy.threshold(1), 1);
    }

    #[test]
    fn test_min_participants_floor() {
        let policy = QuorumPolicy {
            numerator: 1,
            denominator: 3,
            min_participants: 2,
        };
        assert_eq!(policy.threshold(3), 2);
        assert_eq!(policy.threshold(9), 3);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let base = ProtocolConfig::for_participants(&["a", "b", "c", "d"]);
        assert!(base.validate().is_ok());

        let mut empty = base.clone();
        empty.participants.clear();
        assert!(matches!(empty.validate(), Err(ConsensusError::InvalidConfig(_))));

        let mut no_timeout = base.clone();
        no_timeout.round_timeout_ms = 0;
        assert!(no_timeout.validate().is_err());

        let mut no_keeper_timeout = base.clone();
        no_keeper_timeout.keeper_timeout_ms = 0;
        assert!(no_keeper_timeout.validate().is_err());

        let mut duplicate = base.clone();
        duplicate.participants[1].address = "a".into();
        assert!(duplicate.validate().is_err());

        let mut same_rank = base.clone();
        same_rank.participants[1].rank = 0;
        assert!(same_rank.validate().is_err());

        let mut bad_quorum = base.clone();
        bad_quorum.quorum.numerator = 4;
        assert!(bad_quorum.validate().is_err());

        let mut no_task_rounds = base.clone();
        no_task_rounds.max_task_rounds = 0;
        assert!(no_task_rounds.validate().is_err());

        let mut no_attempts = base;
        no_attempts.max_attempts = 0;
        assert!(no_attempts.validate().is_err());
    }

    #[test]
    fn test_from_json_defaults() {
        let json = r#"{
            "participants": [
                {"address": "0xaa", "rank": 0},
                {"address": "0xbb", "rank": 1},
                {"address": "0xcc", "rank": 2}
            ],
            "round_timeout_ms": 1000,
            "keeper_timeout_ms": 2000,
            "keeper_allowed_retries": 2,
            "max_attempts": 5
        }"#;

        let config = ProtocolConfig::from_json(json).unwrap();
        assert_eq!(config.quorum, QuorumPolicy::default());
        assert_eq!(config.settlement_poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.max_task_rounds, DEFAULT_MAX_TASK_ROUNDS);
        assert_eq!(config.keeper_timeout(), Duration::from_millis(2000));
        assert_eq!(config.participant_set().len(), 3);
    }

    #[test]
    fn test_from_json_rejects_empty_group() {
        let json = r#"{
            "participants": [],
            "round_timeout_ms": 1000,
            "keeper_timeout_ms": 2000,
            "keeper_allowed_retries": 2,
            "max_attempts": 5
        }"#;
        assert!(ProtocolConfig::from_json(json).is_err());
    }
}
