//! Fuzz target for persisted queue records.

#![no_main]

use libfuzzer_sys::fuzz_target;
use treemesh::storage::StoredMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = StoredMessage::decode(data) {
        let _ = msg.encode();
    }
});
