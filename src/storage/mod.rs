//! Agent table persistence
//!
//! The registry is the source of truth while the node runs; storage only
//! carries the table across restarts. Backends implement [`AgentStore`]:
//! - `SledAgentStore`: on-disk, keyed by big-endian agent id
//! - `InMemoryAgentStore`: for tests and `--no-persist` runs

mod agents;
mod memory;

pub use agents::SledAgentStore;
pub use memory::InMemoryAgentStore;

use thiserror::Error;

use crate::types::AgentRecord;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store poisoned: {0}")]
    Poisoned(String),
}

/// Pluggable backend for the agent table.
pub trait AgentStore: Send {
    /// Write every record, replacing stored copies with the same id.
    fn save(&self, records: &[AgentRecord]) -> Result<(), StorageError>;

    /// Every stored record, ascending by id.
    fn load(&self) -> Result<Vec<AgentRecord>, StorageError>;

    /// Force buffered writes to disk. `save` alone may leave them to the
    /// backend's background flushing.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
