//! Single-file queue store.
//!
//! The whole record set is rewritten on every change: first to a
//! temporary sibling, then renamed over the real file, so a crash leaves
//! either the old or the new contents and never a torn file.
//!
//! # File Format
//!
//! ```text
//! [magic "TMQ1"][record_len u32][record ...][record_len u32][record ...]...
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use super::{QueueStore, StoreError, StoredMessage};

const MAGIC: &[u8; 4] = b"TMQ1";

/// Queue store backed by one file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<u32, StoredMessage>>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let records = if path.exists() {
            Self::read_file(&path)?
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), records = records.len(), "opened queue store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(path: &Path) -> Result<BTreeMap<u32, StoredMessage>, StoreError> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(BTreeMap::new());
        }
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(StoreError::Corrupt("bad file magic".into()));
        }
        let mut buf = &data[MAGIC.len()..];
        let mut records = BTreeMap::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(StoreError::Corrupt("record length truncated".into()));
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(StoreError::Corrupt("record truncated".into()));
            }
            let msg = StoredMessage::decode(&buf[..len])?;
            buf.advance(len);
            records.insert(msg.id, msg);
        }
        Ok(records)
    }

    fn write_file(&self, records: &BTreeMap<u32, StoredMessage>) -> Result<(), StoreError> {
        let mut out = BytesMut::new();
        out.put_slice(MAGIC);
        for msg in records.values() {
            let record = msg.encode();
            out.put_u32(record.len() as u32);
            out.put_slice(&record);
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&out)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl QueueStore for FileStore {
    fn save(&self, msg: &StoredMessage) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let previous = records.insert(msg.id, msg.clone());
        if let Err(err) = self.write_file(&records) {
            match previous {
                Some(prev) => records.insert(msg.id, prev),
                None => records.remove(&msg.id),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, id: u32) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        let Some(previous) = records.remove(&id) else {
            return Ok(false);
        };
        if let Err(err) = self.write_file(&records) {
            records.insert(id, previous);
            return Err(err);
        }
        Ok(true)
    }

    fn load_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        records.clear();
        self.write_file(&records)
    }
}
