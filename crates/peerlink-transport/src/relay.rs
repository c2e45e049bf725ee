//! Relay adapter.
//!
//! The relay itself (the chat channel that tunnels envelopes between
//! contacts) belongs to the caller. [`RelayTransport`] hands outbound frames
//! to it as [`RelayPacket`]s over a channel; inbound relay frames are fed to
//! [`peerlink_core::SessionRouter::route_relay`] or
//! [`peerlink_core::MessageSession::receive_bytes`] by the caller.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use peerlink_core::{Transport, TransportError, TransportKind, TransportResult, TransportStats};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// One frame for the relay to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPacket {
    /// Peer identity the frame is addressed to
    pub destination: String,
    /// Envelope bytes including the footer
    pub data: Vec<u8>,
}

/// Relay-bound transport for one peer
pub struct RelayTransport {
    destination: String,
    outbound: Sender<RelayPacket>,
    connected: AtomicBool,
    stats: Mutex<TransportStats>,
}

impl RelayTransport {
    /// Transport sending frames for `destination` into `outbound`
    #[must_use]
    pub fn new(destination: impl Into<String>, outbound: Sender<RelayPacket>) -> Self {
        Self {
            destination: destination.into(),
            outbound,
            connected: AtomicBool::new(true),
            stats: Mutex::new(TransportStats::default()),
        }
    }

    /// Peer identity frames are addressed to
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Mark the relay up or down, e.g. when the chat channel reconnects
    pub fn set_connected(&self, connected: bool) {
        debug!(destination = %self.destination, connected, "relay state");
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let packet = RelayPacket {
            destination: self.destination.clone(),
            data: frame.to_vec(),
        };
        match self.outbound.send(packet) {
            Ok(()) => {
                trace!(destination = %self.destination, len = frame.len(), "relay frame queued");
                self.stats.lock().record_send(frame.len());
                Ok(())
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                self.stats.lock().record_send_error();
                Err(TransportError::Closed)
            }
        }
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("destination", &self.destination)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Factory for [`peerlink_core::SessionRouter::with_relay`] building one
/// [`RelayTransport`] per peer over a shared outbound channel
pub fn relay_factory(
    outbound: Sender<RelayPacket>,
) -> impl Fn(&str) -> Option<Arc<dyn Transport>> + Send + Sync + 'static {
    move |remote: &str| {
        let transport: Arc<dyn Transport> = Arc::new(RelayTransport::new(remote, outbound.clone()));
        Some(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::{Envelope, ProtocolVersion, SessionConfig, SessionRouter, SignalingMessage};

    #[test]
    fn test_send_addresses_packets() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let relay = RelayTransport::new("bob@example.com", tx);
        relay.send(b"frame").unwrap();

        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.destination, "bob@example.com");
        assert_eq!(packet.data, b"frame");
        assert_eq!(relay.stats().frames_sent, 1);
    }

    #[test]
    fn test_disconnected_relay_refuses() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let relay = RelayTransport::new("bob", tx);
        relay.set_connected(false);
        assert!(matches!(relay.send(b"x"), Err(TransportError::Closed)));
    }

    #[test]
    fn test_dropped_channel_marks_down() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let relay = RelayTransport::new("bob", tx);
        drop(rx);
        assert!(relay.send(b"x").is_err());
        assert!(!relay.is_connected());
        assert_eq!(relay.stats().send_errors, 1);
    }

    #[test]
    fn test_router_sessions_use_relay() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let router = SessionRouter::new(SessionConfig::default()).with_relay(relay_factory(tx));
        let session = router.get_or_create("carol");
        assert_eq!(session.active_transport(), Some(TransportKind::Relay));

        let msg = SignalingMessage::request("BYE", "MSNMSGR:carol", "MSNSLP/1.0");
        session.send(Envelope::signaling(ProtocolVersion::V1, &msg)).unwrap();

        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.destination, "carol");
        let parsed =
            Envelope::parse(ProtocolVersion::V1, &packet.data, TransportKind::Relay).unwrap();
        assert_eq!(parsed.inner_message().unwrap().method(), Some("BYE"));
    }
}
