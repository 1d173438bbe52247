//! In-memory ledger
//!
//! Stands in for the shared chain in local groups and tests. Transactions
//! confirm after a configurable number of status polls. Failure knobs drop
//! a keeper's submissions (never included) or reject everything.

use crate::batch::SettlementTx;
use crate::error::{Result, SettlementError};
use crate::target::{SettlementTarget, TxStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use mech_consensus::{OutcomeHash, ParticipantId, RoundId, TxHash};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

struct LedgerEntry {
    tx: SettlementTx,
    status: TxStatus,
    polls: u32,
    /// Submitted by a keeper whose transactions are dropped
    dropped: bool,
}

/// A confirmed ledger write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWrite {
    pub round_id: RoundId,
    pub outcome_hash: OutcomeHash,
    pub keeper: ParticipantId,
    pub tx_hash: TxHash,
}

pub struct InMemoryLedger {
    entries: DashMap<TxHash, LedgerEntry>,
    writes_per_outcome: DashMap<OutcomeHash, u32>,
    history: RwLock<Vec<LedgerWrite>>,
    dropped_keepers: RwLock<HashSet<ParticipantId>>,
    reject_reason: RwLock<Option<String>>,
    confirmation_polls: u32,
    nonce: AtomicU64,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            writes_per_outcome: DashMap::new(),
            history: RwLock::new(Vec::new()),
            dropped_keepers: RwLock::new(HashSet::new()),
            reject_reason: RwLock::new(None),
            confirmation_polls: 1,
            nonce: AtomicU64::new(0),
        }
    }

    /// Number of pending status answers before a transaction confirms
    pub fn with_confirmation_polls(mut self, polls: u32) -> Self {
        self.confirmation_polls = polls;
        self
    }

    /// Accept but never include transactions from `keeper`
    pub fn drop_submissions_from(&self, keeper: ParticipantId) {
        self.dropped_keepers.write().insert(keeper);
    }

    pub fn restore_submissions_from(&self, keeper: &ParticipantId) {
        self.dropped_keepers.write().remove(keeper);
    }

    /// Refuse every submission with `reason`
    pub fn reject_all(&self, reason: &str) {
        *self.reject_reason.write() = Some(reason.to_string());
    }

    pub fn accept_all(&self) {
        *self.reject_reason.write() = None;
    }

    /// Confirmed writes of an outcome
    pub fn write_count(&self, outcome_hash: &OutcomeHash) -> u32 {
        self.writes_per_outcome.get(outcome_hash).map(|c| *c).unwrap_or(0)
    }

    /// Confirmed writes, oldest first
    pub fn writes(&self) -> Vec<LedgerWrite> {
        self.history.read().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.entries.len()
    }

    fn next_tx_hash(&self, tx: &SettlementTx) -> TxHash {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&tx.to_bytes());
        hasher.update(&nonce.to_le_bytes());
        TxHash(bs58::encode(hasher.finalize().as_bytes()).into_string())
    }
}

#[async_trait]
impl SettlementTarget for InMemoryLedger {
    async fn submit(&self, tx: &SettlementTx) -> Result<TxHash> {
        if let Some(reason) = self.reject_reason.read().clone() {
            return Err(SettlementError::Rejected(reason));
        }
        tx.validate().map_err(SettlementError::Rejected)?;

        let tx_hash = self.next_tx_hash(tx);
        let dropped = self.dropped_keepers.read().contains(&tx.keeper);
        tracing::debug!(
            "Ledger accepted {} from {} for round {}{}",
            tx_hash,
            tx.keeper,
            tx.round_id,
            if dropped { " (will never be included)" } else { "" }
        );

        self.entries.insert(
            tx_hash.clone(),
            LedgerEntry {
                tx: tx.clone(),
                status: TxStatus::Pending,
                polls: 0,
                dropped,
            },
        );
        Ok(tx_hash)
    }

    async fn status(&self, tx_hash: &TxHash) -> Result<TxStatus> {
        let mut entry = self
            .entries
            .get_mut(tx_hash)
            .ok_or_else(|| SettlementError::UnknownTransaction(tx_hash.clone()))?;

        if entry.dropped || entry.status != TxStatus::Pending {
            return Ok(entry.status.clone());
        }

        entry.polls += 1;
        if entry.polls >= self.confirmation_polls {
            entry.status = TxStatus::Confirmed;
            *self.writes_per_outcome.entry(entry.tx.outcome_hash).or_insert(0) += 1;
            self.history.write().push(LedgerWrite {
                round_id: entry.tx.round_id,
                outcome_hash: entry.tx.outcome_hash,
                keeper: entry.tx.keeper.clone(),
                tx_hash: tx_hash.clone(),
            });
        }
        Ok(entry.status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_consensus::{Outcome, ResultHash, TaskId};

    fn tx(keeper: &str) -> SettlementTx {
        let outcome = Outcome {
            merged: [(TaskId::from("task_1"), ResultHash::of_content(b"r"))]
                .into_iter()
                .collect(),
            agreeing_participants: Default::default(),
            quorum_size: 1,
        };
        SettlementTx::from_outcome(0, 1, ParticipantId::from(keeper), &outcome)
    }

    #[tokio::test]
    async fn test_confirms_after_polls() {
        let ledger = InMemoryLedger::new().with_confirmation_polls(3);
        let tx = tx("agent-0");
        let hash = ledger.submit(&tx).await.unwrap();

        assert_eq!(ledger.status(&hash).await.unwrap(), TxStatus::Pending);
        assert_eq!(ledger.status(&hash).await.unwrap(), TxStatus::Pending);
        assert_eq!(ledger.status(&hash).await.unwrap(), TxStatus::Confirmed);
        assert_eq!(ledger.status(&hash).await.unwrap(), TxStatus::Confirmed);

        assert_eq!(ledger.write_count(&tx.outcome_hash), 1);
        assert_eq!(ledger.writes()[0].keeper, ParticipantId::from("agent-0"));
    }

    #[tokio::test]
    async fn test_resubmission_gets_a_new_hash() {
        let ledger = InMemoryLedger::new();
        let a = ledger.submit(&tx("agent-0")).await.unwrap();
        let b = ledger.submit(&tx("agent-0")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(ledger.submission_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_keeper_never_confirms() {
        let ledger = InMemoryLedger::new();
        ledger.drop_submissions_from(ParticipantId::from("agent-0"));

        let hash = ledger.submit(&tx("agent-0")).await.unwrap();
        for _ in 0..5 {
            assert_eq!(ledger.status(&hash).await.unwrap(), TxStatus::Pending);
        }

        let other = ledger.submit(&tx("agent-1")).await.unwrap();
        assert_eq!(ledger.status(&other).await.unwrap(), TxStatus::Confirmed);
        assert_eq!(ledger.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_rejected() {
        let ledger = InMemoryLedger::new();
        assert!(matches!(
            ledger.status(&TxHash("missing".into())).await,
            Err(SettlementError::UnknownTransaction(_))
        ));

        ledger.reject_all("paused");
        assert_eq!(
            ledger.submit(&tx("agent-0")).await,
            Err(SettlementError::Rejected("paused".into()))
        );
        ledger.accept_all();
        assert!(ledger.submit(&tx("agent-0")).await.is_ok());
    }
}
