//! Error types for the PeerLink core protocol.
//!
//! Errors follow the protocol's failure taxonomy: framing errors
//! ([`HeaderError`]) are recovered by discarding the offending bytes, protocol
//! violations on a direct socket ([`HandshakeError`]) terminate that socket,
//! transport failures ([`crate::TransportError`]) are surfaced as session
//! signals, and session/transfer misuse is reported to the caller.

use crate::header::ProtocolVersion;
use crate::transfer::TransferState;
use thiserror::Error;

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Header or envelope framing error
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// Direct-connection handshake error
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Message session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Transfer session error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// Framing errors raised while parsing or serializing headers and envelopes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Input too short to hold the declared structure
    #[error("header too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size available
        actual: usize,
    },

    /// V2 header length octet is below the minimum or not 4-octet aligned
    #[error("invalid header length: {0}")]
    InvalidHeaderLength(u8),

    /// A TLV entry runs past the end of its region
    #[error("TLV at offset {offset} overruns its region")]
    TlvOverflow {
        /// Offset of the offending TLV within its region
        offset: usize,
    },

    /// TLV type 0x00 is reserved for padding
    #[error("TLV type 0x00 is reserved for padding")]
    ReservedTlvType,

    /// TLV value does not fit a one-octet length
    #[error("TLV value too long: {0} octets")]
    TlvValueTooLong(usize),

    /// A TLV region exceeds the space a one-octet header length allows
    #[error("TLV region too large: {0} octets")]
    TlvRegionTooLarge(usize),

    /// V2 chunk size smaller than the data packet header it must contain
    #[error("chunk size {chunk} smaller than data header length {data_header}")]
    InvalidChunkSize {
        /// Declared chunk size
        chunk: usize,
        /// Declared data header length
        data_header: usize,
    },

    /// Declared payload length exceeds the available bytes
    #[error("payload of {declared} octets exceeds {available} available")]
    PayloadOverflow {
        /// Declared payload length
        declared: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Payload too large for the header's size field
    #[error("payload of {0} octets does not fit the header size field")]
    PayloadTooLarge(usize),
}

/// Direct-connection handshake failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Handshake frame has the wrong length for the negotiated version
    #[error("handshake length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Expected frame length
        expected: usize,
        /// Received frame length
        actual: usize,
    },

    /// Handshake frame belongs to the other protocol version
    #[error("handshake version mismatch: expected {expected:?}")]
    VersionMismatch {
        /// Version this side negotiated
        expected: ProtocolVersion,
    },

    /// Frame parsed but is not flagged as a direct handshake
    #[error("frame is not a direct-connection handshake")]
    NotAHandshake,

    /// Nonce presented by the peer does not match
    #[error("nonce mismatch")]
    NonceMismatch,

    /// Frame arrived that is not valid in the current state
    #[error("unexpected frame in state {0:?}")]
    UnexpectedFrame(crate::handshake::HandshakeState),

    /// Connector has no nonce to present
    #[error("no nonce available to send")]
    MissingNonce,

    /// No handshake is pending manual acknowledgement
    #[error("no handshake pending acknowledgement")]
    NothingPending,
}

/// Message session errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Session has been cleaned up
    #[error("session closed")]
    Closed,

    /// Envelope header variant does not match the session's protocol version
    #[error("protocol version mismatch: session uses {session:?}, envelope is {envelope:?}")]
    VersionMismatch {
        /// Session protocol version
        session: ProtocolVersion,
        /// Envelope protocol version
        envelope: ProtocolVersion,
    },

    /// A transfer with this session id is already registered
    #[error("transfer session {0} already registered")]
    DuplicateTransfer(u32),

    /// No transfer registered under this session id
    #[error("unknown transfer session {0}")]
    UnknownTransfer(u32),
}

/// Transfer session errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Operation not valid in the current state
    #[error("invalid transfer state {state:?} for {operation}")]
    InvalidState {
        /// Current state
        state: TransferState,
        /// Attempted operation
        operation: &'static str,
    },

    /// Operation requires the other transfer direction
    #[error("operation requires a {0} transfer")]
    WrongDirection(&'static str),

    /// Owning message session has been dropped or closed
    #[error("owning message session is gone")]
    SessionGone,

    /// Sink has already been closed or taken
    #[error("sink is closed")]
    SinkClosed,

    /// Sink I/O failure
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sending through the message session failed
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Worker thread could not be spawned
    #[error("failed to spawn transfer worker: {0}")]
    Spawn(String),
}
