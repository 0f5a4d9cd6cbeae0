//! Fuzz target for subtree reports.
//!
//! Reports arrive from neighbours and nest deeply; decoding must stay
//! bounded and never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use treemesh::NodeTree;

fuzz_target!(|data: &[u8]| {
    if let Some(tree) = NodeTree::decode_from_slice(data) {
        let again = NodeTree::decode_from_slice(&tree.encode_to_bytes());
        assert_eq!(again.as_ref(), Some(&tree));
        let _ = tree.has_duplicates();
        let _ = tree.size();
    }
});
