//! In-memory agent store. Not durable.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{AgentStore, StorageError};
use crate::types::{AgentId, AgentRecord};

#[derive(Debug, Default)]
pub struct InMemoryAgentStore {
    records: Mutex<BTreeMap<AgentId, AgentRecord>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AgentStore for InMemoryAgentStore {
    fn save(&self, records: &[AgentRecord]) -> Result<(), StorageError> {
        let mut store = self
            .records
            .lock()
            .map_err(|e| StorageError::Poisoned(e.to_string()))?;
        for record in records {
            store.insert(record.id, record.clone());
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<AgentRecord>, StorageError> {
        let store = self
            .records
            .lock()
            .map_err(|e| StorageError::Poisoned(e.to_string()))?;
        Ok(store.values().cloned().collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
