//! Fuzz target for direct-connection handshakes
//!
//! Arbitrary frames offered to a listener must either establish with the
//! right nonce or fail cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use peerlink_core::{
    DirectHandshake, HandshakeConfig, Nonce, NonceAuth, ProtocolVersion, parse_handshake,
};

fuzz_target!(|data: &[u8]| {
    let nonce = Nonce::from_bytes([0x5A; 16]);
    for version in [ProtocolVersion::V1, ProtocolVersion::V2] {
        let _ = parse_handshake(version, data);

        let mut listener = DirectHandshake::new(HandshakeConfig::listener(
            version,
            NonceAuth::plain(nonce),
        ));
        listener.on_accepted();
        if listener.on_frame(data).is_ok() && listener.is_established() {
            assert_eq!(listener.peer_nonce(), Some(nonce));
        }
    }
});
