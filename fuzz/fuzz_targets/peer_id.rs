//! Fuzz test for peer ID parsing
//!
//! Tests that arbitrary input doesn't cause panics when parsed as peer IDs.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relaymux_core::{Frame, MAX_PEER_ID_LEN, PeerId};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    match PeerId::new(s) {
        Ok(id) => {
            assert!(!s.is_empty() && s.len() <= MAX_PEER_ID_LEN);
            assert_eq!(id.as_str(), s);

            // Valid ids survive the wire
            let frame = Frame::Close { peer_id: id.clone() };
            let decoded = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
        Err(_) => assert!(s.is_empty() || s.len() > MAX_PEER_ID_LEN),
    }
});
