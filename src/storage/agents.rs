//! Sled-backed agent store
//!
//! Key: agent id as u32 big-endian bytes (iterates in id order)
//! Value: JSON-serialized `AgentRecord`

use std::path::Path;

use super::{AgentStore, StorageError};
use crate::types::AgentRecord;

pub struct SledAgentStore {
    tree: sled::Tree,
}

impl SledAgentStore {
    const TREE: &'static str = "agents";

    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let tree = db.open_tree(Self::TREE)?;
        tracing::info!(path = %path.display(), agents = tree.len(), "Agent store opened");
        Ok(Self { tree })
    }
}

impl AgentStore for SledAgentStore {
    /// Does not flush; sled writes the batch out in the background.
    fn save(&self, records: &[AgentRecord]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for record in records {
            batch.insert(record.id.to_be_bytes().to_vec(), serde_json::to_vec(record)?);
        }
        self.tree.apply_batch(batch)?;
        tracing::debug!(agents = records.len(), "Agent table saved");
        Ok(())
    }

    fn load(&self) -> Result<Vec<AgentRecord>, StorageError> {
        let mut records = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<AgentRecord>(&value) {
                Ok(record) => records.push(record),
                // One bad row should not cost the whole table
                Err(e) => tracing::warn!(key = ?key.as_ref(), error = %e, "Skipping unreadable agent record"),
            }
        }
        Ok(records)
    }

    fn flush(&self) -> Result<(), StorageError> {
        let bytes = self.tree.flush()?;
        tracing::debug!(bytes, "Agent store flushed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
