//! # PeerLink Core
//!
//! Core protocol implementation for the PeerLink peer-to-peer transport: the
//! sublayer of a presence/messaging protocol that carries bulk payloads (file
//! transfers, display pictures, activity data) between two endpoints, either
//! tunneled through a relay or over an authenticated direct socket.
//!
//! This crate provides:
//! - V1 (fixed 48-octet, little-endian) and V2 (variable, big-endian, TLV) header codecs
//! - Envelopes with lazily parsed inner signaling messages, acknowledgements and splitting
//! - Reassembly of fragmented control messages
//! - The direct-connection handshake state machine
//! - Message sessions (sequence bookkeeping, transport selection, buffering)
//! - Transfer sessions (threaded data pump over a seekable sink)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Transfer Sessions                           │
//! │   (one worker per outbound transfer, sink-backed receive path)  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Message Session                            │
//! │   (sequence counters, reassembly, relay / direct selection)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Envelopes                               │
//! │   (V1 / V2 headers + payload + footer, split & acknowledge)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectivity;
pub mod envelope;
pub mod error;
mod events;
pub mod handshake;
pub mod header;
pub mod ids;
pub mod inner;
pub mod reassembly;
pub mod session;
pub mod transfer;
pub mod transport;

pub use config::{SessionConfig, TransferConfig};
pub use connectivity::{ConnectionDirection, ConnectivityType, decide_direction};
pub use envelope::{AppId, Envelope};
pub use error::{Error, HandshakeError, HeaderError, Result, SessionError, TransferError};
pub use handshake::{
    DirectHandshake, GREETING, HandshakeAction, HandshakeConfig, HandshakeRole, HandshakeState,
    Nonce, NonceAuth, NonceMode, handshake_frame, parse_handshake,
};
pub use header::{Header, P2PHeader, ProtocolVersion};
pub use header::v1::{V1Flags, V1Header};
pub use header::v2::{DataPacketHeader, OperationCode, PeerInfo, TfCombination, V2Header};
pub use ids::IdGenerator;
pub use inner::{SignalingMessage, StartLine};
pub use reassembly::{Reassembly, ReassemblyPool};
pub use session::{MessageSession, SessionEvent, SessionRouter, SignalingHandler};
pub use transfer::{
    DataSink, TransferDirection, TransferEvent, TransferKind, TransferProgress, TransferSession,
    TransferState,
};
pub use transport::{
    PacketReceiver, Transport, TransportError, TransportKind, TransportResult, TransportStats,
};

/// Maximum payload octets per envelope when tunneled through the relay.
pub const RELAY_MAX_PAYLOAD: usize = 1202;

/// Maximum payload octets per envelope over an established direct socket.
pub const DIRECT_MAX_PAYLOAD: usize = 1352;

/// Size of the V1 binary header in octets.
pub const V1_HEADER_SIZE: usize = 48;

/// Size of the V2 header without any TLVs.
pub const V2_MIN_HEADER_SIZE: usize = 8;

/// Size of the trailing application tag (footer) on relay-framed envelopes.
pub const FOOTER_SIZE: usize = 4;

/// Size of a direct-connection nonce in octets.
pub const NONCE_SIZE: usize = 16;
