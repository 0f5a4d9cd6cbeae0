//! Storage for queued messages that must survive a reboot.
//!
//! The message queue mirrors its CRITICAL (and optionally HIGH) entries to
//! a [`QueueStore`] and replays them on startup. Topology, routing and
//! election state are never persisted.
//!
//! # Storage Backends
//!
//! - [`MemoryStore`] - In-memory storage, lost on restart (tests, hosts without flash)
//! - [`FileStore`] - Single file, rewritten atomically on every change
//! - [`SledStore`] - Sled-based persistent storage (requires `storage-sled` feature)
//!
//! # Example
//!
//! ```ignore
//! use treemesh::storage::{FileStore, QueueStore};
//!
//! let store = FileStore::open("/var/lib/treemesh/queue.bin")?;
//! for msg in store.load_all()? {
//!     println!("{} -> {}", msg.id, msg.destination);
//! }
//! ```

mod file;
mod memory;

#[cfg(feature = "storage-sled")]
mod sled_backend;

pub use file::FileStore;
pub use memory::MemoryStore;

#[cfg(feature = "storage-sled")]
pub use sled_backend::SledStore;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::priority::MessagePriority;

/// Errors reported by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded.
    #[error("corrupt queue record: {0}")]
    Corrupt(String),

    /// The sled database reported an error.
    #[cfg(feature = "storage-sled")]
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
}

/// A queued message as written to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Queue id.
    pub id: u32,
    /// Priority class.
    pub priority: MessagePriority,
    /// Opaque payload.
    pub payload: Bytes,
    /// Destination outside the mesh.
    pub destination: String,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Creation time, microseconds since boot of the node that queued it.
    pub timestamp: u64,
}

impl StoredMessage {
    /// Encode into the record format shared by all backends.
    ///
    /// ```text
    /// [id u32][priority u8][attempts u32][timestamp u64]
    /// [dest_len u16][dest ...][payload_len u32][payload ...]
    /// ```
    pub fn encode(&self) -> Bytes {
        let dest = self.destination.as_bytes();
        let dest_len = dest.len().min(u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(23 + dest_len + self.payload.len());
        buf.put_u32(self.id);
        buf.put_u8(self.priority as u8);
        buf.put_u32(self.attempts);
        buf.put_u64(self.timestamp);
        buf.put_u16(dest_len as u16);
        buf.put_slice(&dest[..dest_len]);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a record produced by [`StoredMessage::encode`].
    pub fn decode(mut data: &[u8]) -> Result<Self, StoreError> {
        let corrupt = |what: &str| StoreError::Corrupt(what.to_string());
        if data.remaining() < 19 {
            return Err(corrupt("record header truncated"));
        }
        let id = data.get_u32();
        let priority = MessagePriority::try_from(data.get_u8())
            .map_err(|p| StoreError::Corrupt(format!("unknown priority {}", p)))?;
        let attempts = data.get_u32();
        let timestamp = data.get_u64();
        let dest_len = data.get_u16() as usize;
        if data.remaining() < dest_len + 4 {
            return Err(corrupt("destination truncated"));
        }
        let destination = std::str::from_utf8(&data[..dest_len])
            .map_err(|_| corrupt("destination is not UTF-8"))?
            .to_string();
        data.advance(dest_len);
        let payload_len = data.get_u32() as usize;
        if data.remaining() != payload_len {
            return Err(corrupt("payload length mismatch"));
        }
        Ok(Self {
            id,
            priority,
            payload: Bytes::copy_from_slice(data),
            destination,
            attempts,
            timestamp,
        })
    }
}

/// Durable mirror of the message queue.
///
/// Called synchronously from the mesh's single scheduling thread, so
/// implementations should keep each call short. Implementations must be
/// thread-safe (`Send + Sync`) so a store can be shared with the
/// application.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait QueueStore: Send + Sync {
    /// Insert or replace the record with `msg.id`.
    fn save(&self, msg: &StoredMessage) -> Result<(), StoreError>;

    /// Remove a record. Returns whether it existed.
    fn remove(&self, id: u32) -> Result<bool, StoreError>;

    /// Every stored record, in id order.
    fn load_all(&self) -> Result<Vec<StoredMessage>, StoreError>;

    /// Remove everything.
    fn clear(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn sample(id: u32) -> StoredMessage {
        StoredMessage {
            id,
            priority: MessagePriority::Critical,
            payload: Bytes::from(format!("payload-{}", id)),
            destination: "alarms".into(),
            attempts: 2,
            timestamp: 1_000 * id as u64,
        }
    }

    #[test]
    fn test_record_codec() {
        let msg = sample(7);
        assert_eq!(StoredMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_record_rejects_corruption() {
        let bytes = sample(7).encode();
        assert!(matches!(
            StoredMessage::decode(&bytes[..bytes.len() - 1]),
            Err(StoreError::Corrupt(_))
        ));
        let mut bad = bytes.to_vec();
        bad[4] = 9;
        assert!(matches!(
            StoredMessage::decode(&bad),
            Err(StoreError::Corrupt(_))
        ));
    }
}
