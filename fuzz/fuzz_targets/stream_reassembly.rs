//! Fuzz target for length-prefixed stream reassembly
//!
//! Feeds arbitrary bytes in arbitrary chunk sizes; the decoder must never
//! panic and must never buffer past one oversized length prefix.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use relaymux_core::codec::{FrameDecoder, LENGTH_PREFIX_SIZE};
use relaymux_core::MAX_FRAME_SIZE;

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    cuts: Vec<u16>,
}

fuzz_target!(|input: Input| {
    let mut decoder = FrameDecoder::new();
    let mut rest = &input.data[..];
    let mut cuts = input.cuts.iter().map(|c| usize::from(*c).max(1));

    while !rest.is_empty() {
        let take = cuts.next().unwrap_or(rest.len()).min(rest.len());
        let (chunk, tail) = rest.split_at(take);
        decoder.extend(chunk);
        rest = tail;

        loop {
            match decoder.decode_next() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                // Unrecoverable for the stream
                Err(_) => return,
            }
        }
        assert!(decoder.buffered() < LENGTH_PREFIX_SIZE + MAX_FRAME_SIZE);
    }
});
