//! In-memory queue store.
//!
//! Keeps records in a map and loses them when dropped. Useful for:
//!
//! - Development and testing
//! - Simulating a reboot by handing the same store to a new queue

use super::{QueueStore, StoreError, StoredMessage};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// In-memory queue store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<u32, StoredMessage>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Fetch one record.
    pub fn get(&self, id: u32) -> Option<StoredMessage> {
        self.records.read().get(&id).cloned()
    }
}

impl QueueStore for MemoryStore {
    fn save(&self, msg: &StoredMessage) -> Result<(), StoreError> {
        self.records.write().insert(msg.id, msg.clone());
        Ok(())
    }

    fn remove(&self, id: u32) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&id).is_some())
    }

    fn load_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.records.write().clear();
        Ok(())
    }
}
