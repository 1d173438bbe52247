//! Checkpoint persistence
//!
//! Checkpoints are content addressed: each one is stored under the hash of
//! its encoding and a head pointer names the latest. Written once per
//! finalized round and read once at startup.

use mech_consensus::Checkpoint;
use parking_lot::RwLock;
use sled::Db;
use std::path::Path;

const HEAD_KEY: &str = "head";

/// Durable home of the last finalized checkpoint
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>>;

    fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
}

/// Content address of an encoded checkpoint
pub fn checkpoint_address(bytes: &[u8]) -> String {
    bs58::encode(blake3::hash(bytes).as_bytes()).into_string()
}

/// Checkpoint store backed by sled
pub struct SledCheckpointStore {
    db: Db,
    /// Encoded checkpoints keyed by content address
    checkpoints: sled::Tree,
    /// Head pointer
    meta: sled::Tree,
}

impl SledCheckpointStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let checkpoints = db.open_tree("checkpoints")?;
        let meta = db.open_tree("meta")?;

        tracing::info!("Opened checkpoint store at {:?}", path.as_ref());

        Ok(Self { db, checkpoints, meta })
    }

    /// Fetch a checkpoint by content address
    pub fn get(&self, address: &str) -> anyhow::Result<Option<Checkpoint>> {
        match self.checkpoints.get(address)? {
            Some(bytes) => {
                if checkpoint_address(&bytes) != address {
                    anyhow::bail!("checkpoint {} is corrupted", address);
                }
                let checkpoint: Checkpoint = bincode::deserialize(&bytes)?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    /// Address of the latest checkpoint
    pub fn head(&self) -> anyhow::Result<Option<String>> {
        match self.meta.get(HEAD_KEY)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    /// Number of checkpoints ever written
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>> {
        match self.head()? {
            Some(address) => self.get(&address),
            None => Ok(None),
        }
    }

    fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let bytes = bincode::serialize(checkpoint)?;
        let address = checkpoint_address(&bytes);

        self.checkpoints.insert(address.as_bytes(), bytes)?;
        self.meta.insert(HEAD_KEY, address.as_bytes())?;
        self.flush()?;

        tracing::debug!(
            "Saved checkpoint for round {} at {}",
            checkpoint.last_finalized_round_id,
            address
        );
        Ok(())
    }
}

/// Checkpoint store kept in memory
#[derive(Default)]
pub struct MemoryCheckpointStore {
    latest: RwLock<Option<Checkpoint>>,
    saves: RwLock<u64>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            latest: RwLock::new(Some(checkpoint)),
            saves: RwLock::new(0),
        }
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.read()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self.latest.read().clone())
    }

    fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        *self.latest.write() = Some(checkpoint.clone());
        *self.saves.write() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_consensus::{OutcomeHash, TxHash};
    use tempfile::tempdir;

    fn checkpoint(round: u64) -> Checkpoint {
        Checkpoint {
            last_finalized_round_id: round,
            last_outcome_hash: OutcomeHash([round as u8; 32]),
            settlement_tx: Some(TxHash(format!("tx-{}", round))),
        }
    }

    #[test]
    fn test_latest_checkpoint_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SledCheckpointStore::open(dir.path()).unwrap();
            assert!(store.load().unwrap().is_none());
            store.save(&checkpoint(1)).unwrap();
            store.save(&checkpoint(2)).unwrap();
        }

        let store = SledCheckpointStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), Some(checkpoint(2)));
        assert_eq!(store.checkpoint_count(), 2);
    }

    #[test]
    fn test_content_addressed() {
        let dir = tempdir().unwrap();
        let store = SledCheckpointStore::open(dir.path()).unwrap();

        store.save(&checkpoint(5)).unwrap();
        store.save(&checkpoint(5)).unwrap();
        assert_eq!(store.checkpoint_count(), 1);

        let head = store.head().unwrap().unwrap();
        let expected = checkpoint_address(&bincode::serialize(&checkpoint(5)).unwrap());
        assert_eq!(head, expected);
        assert_eq!(store.get(&head).unwrap(), Some(checkpoint(5)));
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpointStore::with_checkpoint(checkpoint(3));
        assert_eq!(store.load().unwrap(), Some(checkpoint(3)));

        store.save(&checkpoint(4)).unwrap();
        assert_eq!(store.load().unwrap(), Some(checkpoint(4)));
        assert_eq!(store.save_count(), 1);
    }
}
