//! Fuzz target for frame decoding
//!
//! A single datagram carries exactly one frame; arbitrary bytes must decode
//! to a frame or an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relaymux_core::{Frame, MAX_FRAME_SIZE};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::from_bytes(data) {
        // Anything that decodes must encode again within the frame limit
        let bytes = frame.to_bytes().unwrap();
        assert!(bytes.len() <= MAX_FRAME_SIZE);
        let _ = frame.message_type();
    }
});
