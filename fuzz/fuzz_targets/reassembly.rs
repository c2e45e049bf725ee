//! Fuzz target for the reassembly pool
//!
//! Feeds a stream of arbitrary frames into one pool; inconsistent fragments
//! must be discarded, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerlink_core::{Envelope, ProtocolVersion, ReassemblyPool, TransportKind};

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let version = if selector & 1 == 0 {
        ProtocolVersion::V1
    } else {
        ProtocolVersion::V2
    };

    let mut pool = ReassemblyPool::new(8 * 1024);
    for frame in rest.split(|&b| b == 0xFF) {
        if let Ok(envelope) = Envelope::parse(version, frame, TransportKind::Direct) {
            let _ = pool.push(envelope);
        }
    }
});
