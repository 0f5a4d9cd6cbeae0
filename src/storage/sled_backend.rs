//! Offline queue records in an embedded sled tree.
//!
//! One key per queued message: the queue id as 4 big-endian bytes, so a
//! scan yields records oldest first. The value is the encoded
//! [`StoredMessage`]. Enable with the `storage-sled` cargo feature.

use super::{QueueStore, StoreError, StoredMessage};
use sled::Db;
use std::path::Path;

/// [`QueueStore`] that survives restarts on flash.
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Opens the database in `path`, creating it when missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl QueueStore for SledStore {
    fn save(&self, msg: &StoredMessage) -> Result<(), StoreError> {
        self.db.insert(msg.id.to_be_bytes(), msg.encode().to_vec())?;
        // Flush immediately: a record only counts once it is on flash.
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, id: u32) -> Result<bool, StoreError> {
        let old = self.db.remove(id.to_be_bytes())?;
        self.db.flush()?;
        Ok(old.is_some())
    }

    fn load_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        let mut out = Vec::with_capacity(self.db.len());
        for record in self.db.iter().values() {
            out.push(StoredMessage::decode(&record?)?);
        }
        Ok(out)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("records", &self.db.len())
            .finish()
    }
}
