//! Shared fixtures for the PeerLink integration tests.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use peerlink_core::{
    Envelope, MessageSession, PacketReceiver, ProtocolVersion, SessionConfig, SignalingHandler,
    SignalingMessage, Transport, TransportError, TransportKind, TransportResult,
};
use peerlink_transport::LoopbackTransport;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Default wait for anything crossing a delivery thread
pub const WAIT: Duration = Duration::from_secs(5);

/// In-memory sink whose contents stay readable after the transfer drops it
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedBuffer {
    /// Buffer pre-filled with `data`, positioned at the start
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(Cursor::new(data))))
    }

    /// Copy of the current contents
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().get_ref().clone()
    }
}

impl Read for SharedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.lock().read(buf)
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedBuffer {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.0.lock().seek(pos)
    }
}

/// Deterministic test payload
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Session configuration with a fixed id seed
#[must_use]
pub fn session_config(version: ProtocolVersion, seed: u64) -> SessionConfig {
    SessionConfig::for_version(version).with_seed(seed)
}

/// Weak receiver handle for attaching a session to a transport
#[must_use]
pub fn receiver_of(session: &Arc<MessageSession>) -> Weak<dyn PacketReceiver> {
    let weak: Weak<MessageSession> = Arc::downgrade(session);
    weak
}

/// Two sessions and the loopback pairs joining them
pub struct Peers {
    /// Local side
    pub alice: Arc<MessageSession>,
    /// Remote side
    pub bob: Arc<MessageSession>,
    /// Alice's end of the relay pair
    pub alice_relay: Arc<LoopbackTransport>,
    /// Bob's end of the relay pair
    pub bob_relay: Arc<LoopbackTransport>,
    /// Alice's end of the direct pair, when one was requested
    pub alice_direct: Option<Arc<LoopbackTransport>>,
    /// Bob's end of the direct pair, when one was requested
    pub bob_direct: Option<Arc<LoopbackTransport>>,
}

impl Peers {
    /// Sessions joined by a relay pair and, optionally, a direct pair
    #[must_use]
    pub fn connect(version: ProtocolVersion, direct: bool) -> Self {
        let alice = MessageSession::new("bob", session_config(version, 11));
        let bob = MessageSession::new("alice", session_config(version, 22));

        let (alice_relay, bob_relay) = LoopbackTransport::pair(TransportKind::Relay);
        attach(&alice, &alice_relay, TransportKind::Relay);
        attach(&bob, &bob_relay, TransportKind::Relay);

        let (alice_direct, bob_direct) = if direct {
            let (a, b) = LoopbackTransport::pair(TransportKind::Direct);
            attach(&alice, &a, TransportKind::Direct);
            attach(&bob, &b, TransportKind::Direct);
            (Some(a), Some(b))
        } else {
            (None, None)
        };

        Self {
            alice,
            bob,
            alice_relay,
            bob_relay,
            alice_direct,
            bob_direct,
        }
    }
}

fn attach(session: &Arc<MessageSession>, end: &Arc<LoopbackTransport>, kind: TransportKind) {
    end.attach(receiver_of(session))
        .expect("fresh loopback end attaches");
    let transport: Arc<dyn Transport> = Arc::clone(end) as Arc<dyn Transport>;
    match kind {
        TransportKind::Relay => session.set_relay_transport(Some(transport)),
        TransportKind::Direct => session.set_direct_transport(Some(transport)),
    }
}

/// Direct transport that claims to be up but refuses every frame
#[derive(Debug, Default)]
pub struct FailingTransport;

impl Transport for FailingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn send(&self, _frame: &[u8]) -> TransportResult<()> {
        Err(TransportError::Closed)
    }

    fn close(&self) {}
}

/// Signaling handler forwarding every message it sees
pub struct Recorder {
    messages: Sender<SignalingMessage>,
}

impl Recorder {
    /// Register a recorder on `session`
    #[must_use]
    pub fn install(session: &Arc<MessageSession>) -> Receiver<SignalingMessage> {
        let (tx, rx) = crossbeam_channel::unbounded();
        session.add_handler(Arc::new(Self { messages: tx }));
        rx
    }
}

impl SignalingHandler for Recorder {
    fn handle(&self, _session: &Arc<MessageSession>, envelope: &Envelope) {
        if let Some(message) = envelope.inner_message() {
            let _ = self.messages.send(message.clone());
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
