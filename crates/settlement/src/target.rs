//! Settlement target interface

use crate::batch::SettlementTx;
use crate::error::Result;
use async_trait::async_trait;
use mech_consensus::TxHash;

/// Inclusion status reported by the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    /// Included but invalid, or refused after submission
    Rejected(String),
}

/// The shared ledger outcomes are written to
#[async_trait]
pub trait SettlementTarget: Send + Sync {
    /// Submit a batched settlement, returning its transaction hash
    async fn submit(&self, tx: &SettlementTx) -> Result<TxHash>;

    async fn status(&self, tx_hash: &TxHash) -> Result<TxStatus>;
}
