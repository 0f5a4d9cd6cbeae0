//! Fuzz target for frame and control body decoding.
//!
//! Arbitrary bytes must never panic the decoder, and anything that decodes
//! must encode back to the bytes it came from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use treemesh::{ControlMessage, Frame};

fuzz_target!(|data: &[u8]| {
    let Some(frame) = Frame::decode_from_slice(data) else {
        return;
    };
    let encoded = frame.encode_to_bytes();
    assert_eq!(&encoded[..], &data[..encoded.len()]);

    let _ = ControlMessage::decode(frame.msg_type, &frame.body);
});
