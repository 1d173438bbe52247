//! Mech Consensus - Round-based agreement and settlement-keeper protocol
//!
//! Architecture:
//! - Each agent keeps a per-round PayloadStore fed by the replication substrate
//! - QuorumEvaluator merges the delivered payloads into an Outcome
//! - KeeperSelector elects one keeper per settlement attempt, rotating on timeout
//! - RoundStateMachine composes them and emits Actions for the runtime to execute

pub mod config;
pub mod error;
pub mod keeper;
pub mod payload_store;
pub mod quorum;
pub mod round;
pub mod types;


pub use config::{ParticipantConfig, ProtocolConfig, QuorumPolicy};
pub use error::{ConsensusError, Result};
pub use keeper::{KeeperChoice, KeeperSelector};
pub use payload_store::{BundleReceipt, PayloadStore};
pub use quorum::{MergeOutcome, QuorumEvaluator};
pub use round::{
    AbandonReason, Action, RetryCounters, Round, RoundSnapshot, RoundStateMachine, SettlementReport,
};
pub use types::*;
