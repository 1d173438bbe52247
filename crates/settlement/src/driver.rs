//! Settlement Driver - submits an agreed outcome through the elected keeper
//!
//! Only the keeper calls [`SettlementDriver::submit`]. Every participant,
//! keeper included, tracks the announced transaction with
//! [`SettlementDriver::await_inclusion`], so all agents observe the same
//! confirmation before finalizing.

use crate::batch::SettlementTx;
use crate::error::{Result, SettlementError};
use crate::target::{SettlementTarget, TxStatus};
use mech_consensus::{Outcome, ParticipantId, RoundId, SettlementReport, TxHash};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct SettlementDriver<T: SettlementTarget + ?Sized> {
    target: Arc<T>,
    /// Time a keeper has to get its transaction included
    keeper_timeout: Duration,
    /// Delay between status polls
    poll_interval: Duration,
}

impl<T: SettlementTarget + ?Sized> Clone for SettlementDriver<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            keeper_timeout: self.keeper_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

impl<T: SettlementTarget + ?Sized> SettlementDriver<T> {
    pub fn new(target: Arc<T>, keeper_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            target,
            keeper_timeout,
            poll_interval,
        }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    pub fn keeper_timeout(&self) -> Duration {
        self.keeper_timeout
    }

    /// Build and submit the batched transaction for `outcome`
    pub async fn submit(
        &self,
        round_id: RoundId,
        attempt_number: u32,
        keeper: ParticipantId,
        outcome: &Outcome,
    ) -> Result<TxHash> {
        let tx = SettlementTx::from_outcome(round_id, attempt_number, keeper, outcome);
        tx.validate().map_err(SettlementError::Rejected)?;

        tracing::debug!(
            "Submitting settlement for round {} attempt {}: {} tasks, outcome {}",
            round_id,
            attempt_number,
            tx.entries.len(),
            tx.outcome_hash
        );

        match tokio::time::timeout(self.keeper_timeout, self.target.submit(&tx)).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::SubmitTimeout(self.keeper_timeout.as_millis() as u64)),
        }
    }

    /// Poll until the transaction is confirmed, rejected or `timeout` elapses
    pub async fn await_inclusion(&self, tx_hash: &TxHash, timeout: Duration) -> SettlementReport {
        let deadline = Instant::now() + timeout;

        loop {
            match self.target.status(tx_hash).await {
                Ok(TxStatus::Confirmed) => {
                    return SettlementReport::Confirmed {
                        tx_hash: tx_hash.clone(),
                    }
                }
                Ok(TxStatus::Rejected(reason)) => return SettlementReport::Rejected { reason },
                Ok(TxStatus::Pending) => {}
                Err(SettlementError::Rejected(reason)) => return SettlementReport::Rejected { reason },
                Err(e) => tracing::warn!("Status check for {} failed: {}", tx_hash, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return SettlementReport::TimedOut;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// First earlier submission the target already confirmed.
    ///
    /// A keeper elected after a timeout checks this before submitting, so a
    /// slow but successful predecessor is not written a second time.
    pub async fn find_confirmed(&self, submissions: &[(u32, TxHash)]) -> Option<(u32, TxHash)> {
        for (attempt_number, tx_hash) in submissions {
            match self.target.status(tx_hash).await {
                Ok(TxStatus::Confirmed) => return Some((*attempt_number, tx_hash.clone())),
                Ok(_) => {}
                Err(e) => tracing::warn!("Status check for attempt {} ({}) failed: {}", attempt_number, tx_hash, e),
            }
        }
        None
    }

    /// Submit and wait for inclusion within the keeper timeout
    pub async fn attempt(
        &self,
        round_id: RoundId,
        attempt_number: u32,
        keeper: ParticipantId,
        outcome: &Outcome,
    ) -> SettlementReport {
        let started = Instant::now();
        match self.submit(round_id, attempt_number, keeper, outcome).await {
            Ok(tx_hash) => {
                let remaining = self.keeper_timeout.saturating_sub(started.elapsed());
                self.await_inclusion(&tx_hash, remaining).await
            }
            Err(SettlementError::Rejected(reason)) => SettlementReport::Rejected { reason },
            Err(e) => {
                tracing::warn!("Round {} attempt {}: submission failed: {}", round_id, attempt_number, e);
                SettlementReport::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLedger;
    use mech_consensus::{ResultHash, TaskId};

    fn outcome(content: &[u8]) -> Outcome {
        Outcome {
            merged: [(TaskId::from("task_1"), ResultHash::of_content(content))]
                .into_iter()
                .collect(),
            agreeing_participants: Default::default(),
            quorum_size: 3,
        }
    }

    fn driver(ledger: Arc<InMemoryLedger>) -> SettlementDriver<InMemoryLedger> {
        SettlementDriver::new(ledger, Duration::from_millis(300), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_attempt_confirms() {
        let ledger = Arc::new(InMemoryLedger::new().with_confirmation_polls(2));
        let report = driver(ledger.clone())
            .attempt(0, 1, ParticipantId::from("agent-0"), &outcome(b"x"))
            .await;

        assert!(matches!(report, SettlementReport::Confirmed { .. }));
        assert_eq!(ledger.write_count(&outcome(b"x").hash()), 1);
    }

    #[tokio::test]
    async fn test_dropped_submission_times_out() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.drop_submissions_from(ParticipantId::from("agent-0"));

        let started = Instant::now();
        let report = driver(ledger.clone())
            .attempt(0, 1, ParticipantId::from("agent-0"), &outcome(b"x"))
            .await;

        assert_eq!(report, SettlementReport::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(ledger.write_count(&outcome(b"x").hash()), 0);
    }

    #[tokio::test]
    async fn test_rejection_is_distinct_from_timeout() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.reject_all("nonce too low");

        let report = driver(ledger)
            .attempt(0, 1, ParticipantId::from("agent-0"), &outcome(b"x"))
            .await;
        assert_eq!(
            report,
            SettlementReport::Rejected {
                reason: "nonce too low".into()
            }
        );
    }

    #[tokio::test]
    async fn test_find_confirmed_earlier_submission() {
        let ledger = Arc::new(InMemoryLedger::new());
        let driver = driver(ledger.clone());
        let first = driver
            .submit(0, 1, ParticipantId::from("agent-0"), &outcome(b"x"))
            .await
            .unwrap();

        let unknown = (2, TxHash("0xunknown".into()));
        let found = driver.find_confirmed(&[unknown.clone(), (1, first.clone())]).await;
        assert_eq!(found, Some((1, first)));
        assert_eq!(driver.find_confirmed(&[unknown]).await, None);
        assert_eq!(ledger.write_count(&outcome(b"x").hash()), 1);
    }

    #[tokio::test]
    async fn test_empty_outcome_is_rejected_locally() {
        let ledger = Arc::new(InMemoryLedger::new());
        let empty = Outcome {
            merged: Default::default(),
            agreeing_participants: Default::default(),
            quorum_size: 3,
        };

        let err = driver(ledger.clone())
            .submit(0, 1, ParticipantId::from("agent-0"), &empty)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(ledger.submission_count(), 0);
    }
}
