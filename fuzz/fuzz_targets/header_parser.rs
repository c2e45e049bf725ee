//! Fuzz target for header parsing
//!
//! Tests that both header parsers handle arbitrary input without panicking
//! and that anything they accept re-encodes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerlink_core::{Header, ProtocolVersion};

fuzz_target!(|data: &[u8]| {
    for version in [ProtocolVersion::V1, ProtocolVersion::V2] {
        if let Ok((header, consumed)) = Header::parse(version, data) {
            assert!(consumed <= data.len());
            let _ = header.serialize();
        }
    }
});
