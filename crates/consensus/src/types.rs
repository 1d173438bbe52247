//! Core types for payload collection, agreement and settlement

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Monotonic round counter, aligned with the replication substrate height
pub type RoundId = u64;

/// Stable address of a group participant
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an externally requested task
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Content hash of a computed task result
///
/// Displayed as base58, the way content identifiers usually are.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ResultHash(pub Vec<u8>);

impl ResultHash {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Content-address arbitrary result bytes
    pub fn of_content(content: &[u8]) -> Self {
        Self(blake3::hash(content).as_bytes().to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl fmt::Display for ResultHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for ResultHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultHash({})", self.to_base58())
    }
}

/// Digest identifying an agreed outcome
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct OutcomeHash(pub [u8; 32]);

impl OutcomeHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for OutcomeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for OutcomeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutcomeHash({})", self)
    }
}

/// Transaction hash returned by the settlement target
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A member of the agent group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable address
    pub id: ParticipantId,
    /// Position in the keeper rotation
    pub rank: u32,
    /// Whether the participant contributed to the most recent agreement
    pub live: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, rank: u32) -> Self {
        Self {
            id: ParticipantId::new(id),
            rank,
            live: true,
        }
    }
}

/// Group membership, always kept in rank order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSet {
    members: Vec<Participant>,
}

impl ParticipantSet {
    pub fn new(mut members: Vec<Participant>) -> Self {
        members.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.id.cmp(&b.id)));
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|p| &p.id == id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.members.iter().find(|p| &p.id == id)
    }

    /// Members in rank order
    pub fn ordered(&self) -> &[Participant] {
        &self.members
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.iter().map(|p| &p.id)
    }

    /// Update a member's liveness flag. Returns false for unknown ids.
    pub fn set_live(&mut self, id: &ParticipantId, live: bool) -> bool {
        match self.members.iter_mut().find(|p| &p.id == id) {
            Some(p) => {
                p.live = live;
                true
            }
            None => false,
        }
    }
}

/// One participant's result for one task in one round
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub result_hash: ResultHash,
    pub participant: ParticipantId,
    pub round_id: RoundId,
}

impl TaskPayload {
    pub fn new(task_id: TaskId, result_hash: ResultHash, participant: ParticipantId, round_id: RoundId) -> Self {
        Self {
            task_id,
            result_hash,
            participant,
            round_id,
        }
    }
}

/// Everything a participant reports for a round, delivered atomically
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct PayloadBundle {
    pub round_id: RoundId,
    pub sender: ParticipantId,
    pub payloads: Vec<TaskPayload>,
    /// Tasks the sender's provider failed on; informational only
    pub failed_tasks: Vec<TaskId>,
}

impl PayloadBundle {
    pub fn new(round_id: RoundId, sender: ParticipantId) -> Self {
        Self {
            round_id,
            sender,
            payloads: Vec::new(),
            failed_tasks: Vec::new(),
        }
    }

    pub fn add_result(&mut self, task_id: TaskId, result_hash: ResultHash) {
        self.payloads.push(TaskPayload::new(
            task_id,
            result_hash,
            self.sender.clone(),
            self.round_id,
        ));
    }

    pub fn add_failure(&mut self, task_id: TaskId) {
        self.failed_tasks.push(task_id);
    }
}

/// Phase of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundKind {
    Collect,
    Agree,
    SelectKeeper,
    Settle,
    Finalize,
    /// Terminal failure, reached when an attempt budget is exhausted
    Abandoned,
}

impl RoundKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundKind::Finalize | RoundKind::Abandoned)
    }
}

impl fmt::Display for RoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundKind::Collect => "collect",
            RoundKind::Agree => "agree",
            RoundKind::SelectKeeper => "select_keeper",
            RoundKind::Settle => "settle",
            RoundKind::Finalize => "finalize",
            RoundKind::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// The agreed mapping of tasks to results for a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub merged: BTreeMap<TaskId, ResultHash>,
    /// Union of the backers of every resolved task
    pub agreeing_participants: BTreeSet<ParticipantId>,
    pub quorum_size: usize,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Hash of the merged mapping.
    ///
    /// The round id is deliberately left out: the same agreed content hashes
    /// identically in any round, which is what the checkpoint check relies on.
    pub fn hash(&self) -> OutcomeHash {
        let encoded = borsh::to_vec(&self.merged).expect("Outcome serialization should not fail");

        let mut hasher = blake3::Hasher::new();
        hasher.update(&encoded);
        OutcomeHash(*hasher.finalize().as_bytes())
    }
}

/// Status of a single settlement attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Pending,
    Confirmed,
    TimedOut,
    Rejected,
}

/// One keeper's attempt to settle an outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAttempt {
    pub attempt_number: u32,
    pub keeper: ParticipantId,
    pub submitted_tx_hash: Option<TxHash>,
    pub status: AttemptStatus,
}

impl SettlementAttempt {
    pub fn pending(attempt_number: u32, keeper: ParticipantId) -> Self {
        Self {
            attempt_number,
            keeper,
            submitted_tx_hash: None,
            status: AttemptStatus::Pending,
        }
    }

    pub fn with_tx_hash(&self, tx_hash: TxHash) -> Self {
        Self {
            submitted_tx_hash: Some(tx_hash),
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: AttemptStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Durable record of the last finalized round
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_finalized_round_id: RoundId,
    pub last_outcome_hash: OutcomeHash,
    /// Transaction that settled the outcome
    pub settlement_tx: Option<TxHash>,
}

/// Keeper announcement that the batched settlement was submitted
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct SettlementNotice {
    pub round_id: RoundId,
    pub attempt_number: u32,
    pub keeper: ParticipantId,
    pub outcome_hash: OutcomeHash,
    pub tx_hash: TxHash,
}

/// Messages agents exchange through the replication substrate
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// New task requests entering the group's pending set
    Requests(Vec<TaskId>),

    /// A participant's results for a round
    Payloads(PayloadBundle),

    /// The elected keeper submitted the settlement transaction
    SettlementSubmitted(SettlementNotice),
}

impl ProtocolMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("ProtocolMessage serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(entries: &[(&str, &[u8])]) -> Outcome {
        Outcome {
            merged: entries
                .iter()
                .map(|(t, h)| (TaskId::from(*t), ResultHash::new(h.to_vec())))
                .collect(),
            agreeing_participants: BTreeSet::new(),
            quorum_size: 3,
        }
    }

    #[test]
    fn test_outcome_hash_ignores_participants() {
        let a = outcome(&[("task_1", b"h1"), ("task_2", b"h2")]);
        let mut b = a.clone();
        b.agreeing_participants.insert(ParticipantId::from("agent-0"));
        b.quorum_size = 2;

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_outcome_hash_is_unambiguous() {
        // Borsh length prefixes keep ("ab","c") and ("a","bc") apart
        let a = outcome(&[("ab", b"c")]);
        let b = outcome(&[("a", b"bc")]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_participant_set_rank_order() {
        let set = ParticipantSet::new(vec![
            Participant::new("c", 2),
            Participant::new("a", 0),
            Participant::new("b", 1),
        ]);
        let ids: Vec<&str> = set.ids().map(|p| p.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_message_wire_format() {
        let mut bundle = PayloadBundle::new(7, ParticipantId::from("agent-1"));
        bundle.add_result(TaskId::from("task_1"), ResultHash::of_content(b"answer"));
        bundle.add_failure(TaskId::from("task_2"));

        let msg = ProtocolMessage::Payloads(bundle);
        let decoded = ProtocolMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(decoded, msg);

        assert!(ProtocolMessage::from_bytes(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn test_result_hash_display_is_base58() {
        let hash = ResultHash::new(vec![0u8, 1, 2]);
        assert_eq!(hash.to_string(), bs58::encode([0u8, 1, 2]).into_string());
        assert!(!hash.is_empty());
        assert!(ResultHash::new(Vec::new()).is_empty());
    }
}
