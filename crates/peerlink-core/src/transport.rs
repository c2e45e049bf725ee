//! Transport abstraction shared by the relay and the direct socket.
//!
//! A [`Transport`] is a reliable, ordered, message-oriented pipe. Outbound
//! envelopes are handed over as complete frames with [`Transport::send`];
//! inbound frames are delivered asynchronously to a [`PacketReceiver`],
//! never from inside `send`, so the owner may hold its own lock while sending.

use std::fmt;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Connection could not be established
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No connection arrived before the listen deadline
    #[error("listen timed out")]
    ListenTimeout,

    /// Direct-connection handshake was rejected
    #[error("handshake failed: {0}")]
    Handshake(#[from] crate::error::HandshakeError),

    /// Frame exceeds the transport's size limit
    #[error("frame of {0} octets too large")]
    FrameTooLarge(usize),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Which kind of channel carries the envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Tunneled through the chat relay; frames carry the 4-octet footer
    Relay,
    /// Authenticated direct socket; no footer
    Direct,
}

impl TransportKind {
    /// Maximum payload octets per envelope on this transport
    #[must_use]
    pub const fn max_payload(self) -> usize {
        match self {
            Self::Relay => crate::RELAY_MAX_PAYLOAD,
            Self::Direct => crate::DIRECT_MAX_PAYLOAD,
        }
    }

    /// Whether envelopes on this transport end with the footer
    #[must_use]
    pub const fn has_footer(self) -> bool {
        matches!(self, Self::Relay)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Message-oriented transport.
///
/// Implementations must not call back into the [`PacketReceiver`] from inside
/// [`Transport::send`] or [`Transport::close`].
pub trait Transport: Send + Sync {
    /// Kind of channel
    fn kind(&self) -> TransportKind;

    /// Whether the transport can currently carry frames
    fn is_connected(&self) -> bool;

    /// Queue one complete envelope frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport is down, or an
    /// I/O error from the underlying channel.
    fn send(&self, frame: &[u8]) -> TransportResult<()>;

    /// Close the transport; later sends fail with [`TransportError::Closed`]
    fn close(&self);

    /// Traffic counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Receiver of inbound frames
pub trait PacketReceiver: Send + Sync {
    /// A complete frame arrived on a transport of the given kind
    fn receive(&self, kind: TransportKind, frame: &[u8]);

    /// The transport of the given kind went down. `unsent` holds the frames
    /// it accepted from `send` but never wrote, oldest first.
    fn transport_closed(&self, kind: TransportKind, unsent: Vec<Vec<u8>>);
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub frames_sent: u64,
    /// Total frames received
    pub frames_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.frames_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
