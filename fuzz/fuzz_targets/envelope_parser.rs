//! Fuzz target for envelope parsing
//!
//! Covers both framings, lazy signaling parsing and acknowledgement
//! construction on whatever the parser accepts.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerlink_core::{Envelope, ProtocolVersion, TransportKind};

fuzz_target!(|data: &[u8]| {
    for version in [ProtocolVersion::V1, ProtocolVersion::V2] {
        for kind in [TransportKind::Relay, TransportKind::Direct] {
            if let Ok(envelope) = Envelope::parse(version, data, kind) {
                let _ = envelope.inner_message();
                let _ = envelope.create_acknowledgement().to_bytes(kind);
            }
        }
    }
});
