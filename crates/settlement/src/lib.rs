//! Keeper Settlement - Commits agreed outcomes to the shared ledger
//!
//! Handles the keeper side of a round:
//! - Building the batched settlement transaction from an Outcome
//! - Submitting it and waiting for inclusion under the keeper timeout
//! - An in-memory ledger for local groups and tests

pub mod batch;
pub mod driver;
pub mod error;
pub mod memory;
pub mod target;

pub use batch::SettlementTx;
pub use driver::SettlementDriver;
pub use error::SettlementError;
pub use memory::InMemoryLedger;
pub use target::{SettlementTarget, TxStatus};
