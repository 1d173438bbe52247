//! Settlement Errors

use mech_consensus::TxHash;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// The target refused the transaction; retrying will not help
    #[error("settlement rejected: {0}")]
    Rejected(String),

    /// The target could not be reached
    #[error("settlement target unavailable: {0}")]
    Unavailable(String),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxHash),

    #[error("submission did not complete within {0} ms")]
    SubmitTimeout(u64),
}

impl SettlementError {
    /// Whether the failure should rotate the keeper rather than abandon the round
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SettlementError::Rejected(_))
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
