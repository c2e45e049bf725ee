//! In-memory transport pair.
//!
//! Two [`LoopbackTransport`]s connected back to back: a frame sent on one is
//! delivered to the receiver attached to the other, from that side's
//! delivery thread. Useful for tests and for embedding two endpoints in one
//! process.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use peerlink_core::{
    PacketReceiver, Transport, TransportError, TransportKind, TransportResult, TransportStats,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, trace};

enum Delivery {
    Frame(Vec<u8>),
    /// Peer closed its end
    Closed,
    /// Local end closed; stop without notifying
    Shutdown,
}

/// One end of an in-memory transport pair
pub struct LoopbackTransport {
    kind: TransportKind,
    name: &'static str,
    peer: Sender<Delivery>,
    own: Sender<Delivery>,
    inbox: Mutex<Option<Receiver<Delivery>>>,
    connected: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Mutex<TransportStats>,
}

impl LoopbackTransport {
    /// Create a connected pair presenting themselves as `kind`
    #[must_use]
    pub fn pair(kind: TransportKind) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));

        let end = |name, peer: &Sender<Delivery>, own: &Sender<Delivery>, inbox| {
            Arc::new(Self {
                kind,
                name,
                peer: peer.clone(),
                own: own.clone(),
                inbox: Mutex::new(Some(inbox)),
                connected: Arc::clone(&connected),
                worker: Mutex::new(None),
                stats: Mutex::new(TransportStats::default()),
            })
        };
        let a = end("loopback-a", &b_tx, &a_tx, a_rx);
        let b = end("loopback-b", &a_tx, &b_tx, b_rx);
        (a, b)
    }

    /// Deliver inbound frames to `receiver` from a delivery thread.
    ///
    /// Frames sent before attaching are delivered once attached.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] if already attached and an
    /// I/O error if the thread cannot be spawned.
    pub fn attach(&self, receiver: Weak<dyn PacketReceiver>) -> TransportResult<()> {
        let inbox = self
            .inbox
            .lock()
            .take()
            .ok_or_else(|| TransportError::InvalidConfig("loopback already attached".into()))?;
        let kind = self.kind;

        let handle = std::thread::Builder::new()
            .name(self.name.into())
            .spawn(move || {
                for delivery in inbox {
                    let Some(receiver) = receiver.upgrade() else {
                        return;
                    };
                    match delivery {
                        Delivery::Frame(frame) => receiver.receive(kind, &frame),
                        Delivery::Closed => {
                            receiver.transport_closed(kind, Vec::new());
                            return;
                        }
                        Delivery::Shutdown => return,
                    }
                }
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.peer
            .send(Delivery::Frame(frame.to_vec()))
            .map_err(|_| TransportError::Closed)?;
        trace!(end = self.name, len = frame.len(), "loopback frame");
        self.stats.lock().record_send(frame.len());
        Ok(())
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(end = self.name, "loopback closed");
            let _ = self.peer.send(Delivery::Closed);
        }
        let _ = self.own.send(Delivery::Shutdown);
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("end", &self.name)
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}
