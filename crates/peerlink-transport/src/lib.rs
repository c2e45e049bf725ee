//! # PeerLink Transport
//!
//! Concrete transports for PeerLink message sessions.
//!
//! This crate provides:
//! - Authenticated direct TCP connections (listener and connector) driving
//!   the direct-connection handshake over length-prefixed frames
//! - A relay adapter handing frames to a caller-owned chat channel
//! - An in-memory loopback pair for tests and embedding
//!
//! Every transport implements [`peerlink_core::Transport`] and delivers
//! inbound frames to a [`peerlink_core::PacketReceiver`] from its own
//! thread, never from inside `send`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod direct;
pub mod framing;
pub mod loopback;
pub mod relay;

pub use direct::{
    DirectConfig, DirectConnection, DirectListener, DirectTransport, LISTEN_TIMEOUT, connect,
};
pub use framing::{encode_frame, read_frame, write_frame};
pub use loopback::LoopbackTransport;
pub use relay::{RelayPacket, RelayTransport, relay_factory};
