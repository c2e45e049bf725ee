//! Message sessions: the per-peer multiplexer.
//!
//! A [`MessageSession`] owns the sequence counters and reassembly pool for
//! one remote peer, fragments outbound envelopes to the active transport's
//! ceiling and picks between the relay and an authenticated direct socket.
//! Envelopes submitted while no transport can carry them wait in a bounded
//! outbox and are flushed, in submission order, as soon as one is assigned.
//!
//! Inbound envelopes with a non-zero session id are routed to the matching
//! [`TransferSession`]; control envelopes go to every registered
//! [`SignalingHandler`]. Handlers, transfers and automatic acknowledgements
//! always run outside the session lock.

mod router;
pub mod sequence;

pub use router::SessionRouter;

use crate::config::SessionConfig;
use crate::envelope::Envelope;
use crate::error::SessionError;
use crate::events::Subscribers;
use crate::header::v1::V1Header;
use crate::header::v2::OperationCode;
use crate::header::{Header, P2PHeader, ProtocolVersion};
use crate::ids::IdGenerator;
use crate::reassembly::{Reassembly, ReassemblyPool};
use crate::transfer::TransferSession;
use crate::transport::{PacketReceiver, Transport, TransportKind};
use crossbeam_channel::Receiver;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use sequence::{LocalSequence, RemoteSequence};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Consumer of control-plane envelopes
pub trait SignalingHandler: Send + Sync {
    /// A complete control envelope arrived on `session`
    fn handle(&self, session: &Arc<MessageSession>, envelope: &Envelope);
}

/// Signals raised by a message session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transport failed or closed; envelopes are buffered until a
    /// replacement is assigned
    TransportInvalid(TransportKind),
    /// The transport carrying new envelopes changed
    TransportChanged(Option<TransportKind>),
    /// The peer acknowledged the message with this ack reference
    Acknowledged(u32),
    /// An authenticated direct socket became the active transport
    DirectEstablished,
    /// The session was closed
    Closed,
}

struct Inner {
    local: LocalSequence,
    remote: RemoteSequence,
    ids: IdGenerator,
    pool: ReassemblyPool,
    relay: Option<Arc<dyn Transport>>,
    direct: Option<Arc<dyn Transport>>,
    outbox: VecDeque<Envelope>,
    /// Wire ack reference to the reference handed back by `send`
    pending_acks: HashMap<u32, u32>,
    package_number: u16,
    closed: bool,
}

impl Inner {
    fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        self.direct
            .iter()
            .chain(self.relay.iter())
            .find(|t| t.is_connected())
            .cloned()
    }

    fn active_kind(&self) -> Option<TransportKind> {
        self.active_transport().map(|t| t.kind())
    }
}

/// Per-peer message session
pub struct MessageSession {
    remote: String,
    config: SessionConfig,
    weak_self: Weak<MessageSession>,
    inner: Mutex<Inner>,
    transfers: DashMap<u32, Arc<TransferSession>>,
    handlers: RwLock<Vec<Arc<dyn SignalingHandler>>>,
    events: Subscribers<SessionEvent>,
}

impl MessageSession {
    /// Create a session with the peer identified by `remote`
    #[must_use]
    pub fn new(remote: impl Into<String>, config: SessionConfig) -> Arc<Self> {
        let mut ids = IdGenerator::from_optional_seed(config.id_seed);
        let base = ids.next_id();
        let pool = ReassemblyPool::new(config.max_control_message);

        Arc::new_cyclic(|weak_self| Self {
            remote: remote.into(),
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner {
                local: LocalSequence::new(base),
                remote: RemoteSequence::default(),
                ids,
                pool,
                relay: None,
                direct: None,
                outbox: VecDeque::new(),
                pending_acks: HashMap::new(),
                package_number: 0,
                closed: false,
            }),
            config,
            transfers: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            events: Subscribers::new(),
        })
    }

    /// Peer identity
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Negotiated wire format
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.config.version
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Receive future session events
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a control-plane handler
    pub fn add_handler(&self, handler: Arc<dyn SignalingHandler>) {
        self.handlers.write().push(handler);
    }

    /// Whether [`MessageSession::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Kind of the transport new envelopes would go out on
    #[must_use]
    pub fn active_transport(&self) -> Option<TransportKind> {
        self.inner.lock().active_kind()
    }

    /// Whether an authenticated direct socket is carrying traffic
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.active_transport() == Some(TransportKind::Direct)
    }

    /// Payload ceiling of the active transport (the relay's if none)
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.ceiling(self.active_transport())
    }

    fn ceiling(&self, kind: Option<TransportKind>) -> usize {
        match kind {
            Some(TransportKind::Direct) => self.config.direct_max_payload,
            Some(TransportKind::Relay) | None => self.config.relay_max_payload,
        }
    }

    /// Envelopes waiting for a transport
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.inner.lock().outbox.len()
    }

    /// Control messages partially reassembled
    #[must_use]
    pub fn pending_reassembly(&self) -> usize {
        self.inner.lock().pool.len()
    }

    /// Local `(base, current)` sequence values
    #[must_use]
    pub fn local_sequence(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.local.base(), inner.local.current())
    }

    /// Remote `(base, current)` sequence values
    #[must_use]
    pub fn remote_sequence(&self) -> (Option<u32>, u32) {
        let inner = self.inner.lock();
        (inner.remote.base(), inner.remote.current())
    }

    /// Reserve a V1 identifier shared by every chunk of one message
    pub fn next_identifier(&self) -> u32 {
        self.inner.lock().local.next_v1()
    }

    /// Next non-zero V2 package number
    pub fn next_package_number(&self) -> u16 {
        let mut inner = self.inner.lock();
        inner.package_number = inner.package_number.wrapping_add(1).max(1);
        inner.package_number
    }

    /// Fresh transfer session id not in use on this session
    pub fn allocate_session_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        loop {
            let id = inner.ids.next_id();
            if !self.transfers.contains_key(&id) {
                return id;
            }
        }
    }

    /// Assign (or clear) the relay transport and flush the outbox
    pub fn set_relay_transport(&self, transport: Option<Arc<dyn Transport>>) {
        let mut inner = self.inner.lock();
        inner.relay = transport;
        debug!(remote = %self.remote, relay = inner.relay.is_some(), "relay transport assigned");
        self.events.emit(SessionEvent::TransportChanged(inner.active_kind()));
        self.flush(&mut inner);
    }

    /// Assign (or clear) the authenticated direct transport.
    ///
    /// Once assigned the direct socket carries all traffic; the relay is
    /// only used again if it fails. Transfers waiting for a direct
    /// connection are started.
    pub fn set_direct_transport(&self, transport: Option<Arc<dyn Transport>>) {
        let established = transport.is_some();
        {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.direct.take() {
                old.close();
            }
            inner.direct = transport;
            if established {
                info!(remote = %self.remote, "direct transport active");
                self.events.emit(SessionEvent::DirectEstablished);
            }
            self.events.emit(SessionEvent::TransportChanged(inner.active_kind()));
            self.flush(&mut inner);
        }

        if established {
            for transfer in self.transfer_list() {
                transfer.on_direct_connection_ready();
            }
        }
    }

    /// Register a transfer session under its id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateTransfer`] if the id is taken.
    pub fn add_transfer(&self, transfer: Arc<TransferSession>) -> Result<(), SessionError> {
        use dashmap::mapref::entry::Entry;
        match self.transfers.entry(transfer.id()) {
            Entry::Occupied(_) => Err(SessionError::DuplicateTransfer(transfer.id())),
            Entry::Vacant(slot) => {
                debug!(remote = %self.remote, session_id = transfer.id(), "transfer registered");
                slot.insert(transfer);
                Ok(())
            }
        }
    }

    /// Remove a transfer session
    pub fn remove_transfer(&self, session_id: u32) -> Option<Arc<TransferSession>> {
        self.transfers.remove(&session_id).map(|(_, t)| t)
    }

    /// Transfer session registered under `session_id`
    #[must_use]
    pub fn transfer(&self, session_id: u32) -> Option<Arc<TransferSession>> {
        self.transfers.get(&session_id).map(|t| Arc::clone(t.value()))
    }

    /// Snapshot of the registered transfers
    #[must_use]
    pub fn transfer_list(&self) -> Vec<Arc<TransferSession>> {
        self.transfers.iter().map(|t| Arc::clone(t.value())).collect()
    }

    /// Send an envelope, returning its acknowledgement reference.
    ///
    /// Unset identifiers (and V1 ack references) are assigned, the envelope
    /// is split to the active transport's ceiling and queued behind any
    /// buffered envelopes. When the outbox is full the caller is paused
    /// until a transport drains it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after [`MessageSession::close`] and
    /// [`SessionError::VersionMismatch`] for an envelope of the other format.
    pub fn send(&self, mut envelope: Envelope) -> Result<u32, SessionError> {
        if envelope.version() != self.config.version {
            return Err(SessionError::VersionMismatch {
                session: self.config.version,
                envelope: envelope.version(),
            });
        }

        let mut guard = loop {
            let guard = self.inner.lock();
            if guard.closed {
                return Err(SessionError::Closed);
            }
            if guard.outbox.len() < self.config.outbox_capacity {
                break guard;
            }
            drop(guard);
            trace!(remote = %self.remote, "outbox full, pausing producer");
            std::thread::sleep(self.config.producer_pause);
        };
        let inner = &mut *guard;
        let ceiling = self.ceiling(inner.active_kind());
        let is_ack = envelope.is_acknowledgement();

        let ack_ref = match envelope.header_mut() {
            Header::V1(h) => {
                if h.identifier == 0 {
                    h.identifier = inner.local.next_v1();
                }
                if h.ack_session_id == 0 {
                    h.ack_session_id = inner.ids.next_nonzero();
                }
                let pieces = envelope.split(ceiling, &mut inner.ids);
                let ack_ref = pieces.last().map_or(0, ack_reference);
                let is_final = pieces
                    .last()
                    .and_then(|p| p.header().as_v1())
                    .is_some_and(V1Header::is_final_chunk);
                if !is_ack && is_final {
                    inner.pending_acks.insert(ack_ref, ack_ref);
                }
                inner.outbox.extend(pieces);
                ack_ref
            }
            Header::V2(h) => {
                let assign = h.identifier == 0;
                let pieces = envelope.split(ceiling, &mut inner.ids);
                let mut ack_ref = 0;
                let mut wants_ack = false;
                for mut piece in pieces {
                    if assign {
                        let id = inner.local.next_v2(piece.header().wire_chunk_size());
                        piece.header_mut().set_identifier(id);
                    }
                    ack_ref = ack_reference(&piece);
                    wants_ack = piece
                        .header()
                        .as_v2()
                        .is_some_and(|h| h.operation_code.contains(OperationCode::RAK));
                    inner.outbox.push_back(piece);
                }
                if wants_ack && !is_ack {
                    inner.pending_acks.insert(ack_ref, ack_ref);
                }
                ack_ref
            }
        };

        self.flush(inner);
        Ok(ack_ref)
    }

    /// Drain the outbox onto the active transport, falling back to the
    /// other transport when a send fails.
    fn flush(&self, inner: &mut Inner) {
        while !inner.outbox.is_empty() {
            let Some(transport) = inner.active_transport() else {
                trace!(
                    remote = %self.remote,
                    queued = inner.outbox.len(),
                    "no transport, buffering"
                );
                return;
            };
            let kind = transport.kind();
            let ceiling = self.ceiling(Some(kind));

            if inner.outbox.front().is_some_and(|e| e.payload().len() > ceiling) {
                self.resplit_front(inner, ceiling);
                continue;
            }

            let Some(envelope) = inner.outbox.front() else {
                return;
            };
            let frame = match envelope.to_bytes(kind) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(remote = %self.remote, error = %err, "dropping unencodable envelope");
                    inner.outbox.pop_front();
                    continue;
                }
            };

            match transport.send(&frame) {
                Ok(()) => {
                    trace!(remote = %self.remote, %kind, len = frame.len(), "envelope sent");
                    inner.outbox.pop_front();
                }
                Err(err) => {
                    warn!(remote = %self.remote, %kind, error = %err, "transport failed");
                    match kind {
                        TransportKind::Direct => inner.direct = None,
                        TransportKind::Relay => inner.relay = None,
                    }
                    self.events.emit(SessionEvent::TransportInvalid(kind));
                    self.events.emit(SessionEvent::TransportChanged(inner.active_kind()));
                }
            }
        }
    }

    /// Split the front of the outbox to a smaller ceiling after falling
    /// back to the relay.
    ///
    /// The last V1 piece keeps the original ack reference. V2 identifiers
    /// count octets, so the pieces and everything queued behind them are
    /// renumbered from the front's identifier and pending acknowledgements
    /// follow the new references.
    fn resplit_front(&self, inner: &mut Inner, ceiling: usize) {
        let Some(envelope) = inner.outbox.pop_front() else {
            return;
        };
        let mut pieces = envelope.split(ceiling, &mut inner.ids);
        debug!(
            remote = %self.remote,
            pieces = pieces.len(),
            ceiling,
            "re-splitting queued envelope"
        );

        match envelope.header() {
            Header::V1(h) => {
                if let Some(last) = pieces.last_mut().and_then(|p| p.header_mut().as_v1_mut()) {
                    last.ack_session_id = h.ack_session_id;
                }
                for piece in pieces.into_iter().rev() {
                    inner.outbox.push_front(piece);
                }
            }
            Header::V2(_) => {
                let behind: Vec<Envelope> = inner.outbox.drain(..).collect();
                let original_ref = ack_reference(&envelope);
                inner.local.rewind(envelope.identifier());

                let last = pieces.len().saturating_sub(1);
                for (i, mut piece) in pieces.into_iter().enumerate() {
                    let id = inner.local.next_v2(piece.header().wire_chunk_size());
                    piece.header_mut().set_identifier(id);
                    if i == last {
                        remap_ack(&mut inner.pending_acks, original_ref, ack_reference(&piece));
                    }
                    inner.outbox.push_back(piece);
                }
                for mut queued in behind {
                    let old_ref = ack_reference(&queued);
                    let id = inner.local.next_v2(queued.header().wire_chunk_size());
                    queued.header_mut().set_identifier(id);
                    remap_ack(&mut inner.pending_acks, old_ref, ack_reference(&queued));
                    inner.outbox.push_back(queued);
                }
            }
        }
    }

    /// Put frames a failed transport accepted but never wrote back at the
    /// head of the outbox, oldest first
    fn requeue(&self, inner: &mut Inner, kind: TransportKind, unsent: &[Vec<u8>]) {
        for frame in unsent.iter().rev() {
            let mut envelope = match Envelope::parse(self.config.version, frame, kind) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(remote = %self.remote, %kind, error = %err, "dropping unsent frame");
                    continue;
                }
            };
            // direct framing carries no footer
            if !kind.has_footer() && envelope.version() == ProtocolVersion::V1 {
                if let Some(transfer) = self.transfer(envelope.session_id()) {
                    envelope.set_footer(transfer.kind().app_id());
                }
            }
            inner.outbox.push_front(envelope);
        }
    }

    /// Handle an inbound envelope
    pub fn receive(&self, envelope: Envelope) {
        if envelope.version() != self.config.version {
            warn!(
                remote = %self.remote,
                version = %envelope.version(),
                "discarding envelope of wrong version"
            );
            return;
        }

        let (complete, fragment_ref) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.remote.observe(envelope.header());
            // the peer expects the acknowledgement of the completing fragment
            let fragment_ref = match envelope.header() {
                Header::V2(h) => Some(h.identifier.wrapping_add(h.wire_chunk_size())),
                Header::V1(_) => None,
            };
            let complete = match inner.pool.push(envelope) {
                Reassembly::Complete(complete) => complete,
                Reassembly::Buffered | Reassembly::Discarded => return,
            };

            if complete.is_acknowledgement() {
                let acked = match complete.header() {
                    Header::V1(h) => Some(h.ack_identifier),
                    Header::V2(h) => h.ack_identifier(),
                };
                if let Some(reference) = acked.and_then(|a| inner.pending_acks.remove(&a)) {
                    trace!(remote = %self.remote, ack = reference, "message acknowledged");
                    self.events.emit(SessionEvent::Acknowledged(reference));
                }
                return;
            }
            (complete, fragment_ref)
        };

        if self.config.auto_acknowledge && wants_acknowledgement(&complete) {
            let mut ack = complete.create_acknowledgement();
            if let (Some(reference), Some(h)) = (fragment_ref, ack.header_mut().as_v2_mut()) {
                h.set_ack_identifier(reference);
            }
            if let Err(err) = self.send(ack) {
                warn!(remote = %self.remote, error = %err, "failed to acknowledge");
            }
        }

        let session_id = complete.session_id();
        if session_id != 0 {
            match self.transfer(session_id) {
                Some(transfer) => transfer.handle_envelope(&complete),
                None => warn!(remote = %self.remote, session_id, "envelope for unknown transfer"),
            }
            return;
        }

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler.handle(&this, &complete);
        }
    }

    /// Parse and handle a frame from a transport of the given kind; framing
    /// errors discard the frame
    pub fn receive_bytes(&self, kind: TransportKind, frame: &[u8]) {
        match Envelope::parse(self.config.version, frame, kind) {
            Ok(envelope) => self.receive(envelope),
            Err(err) => {
                warn!(remote = %self.remote, %kind, error = %err, "discarding malformed frame");
            }
        }
    }

    /// Close the session: abort transfers, drop buffered state and close the
    /// direct socket
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.outbox.clear();
            inner.pool.clear();
            inner.pending_acks.clear();
            if let Some(direct) = inner.direct.take() {
                direct.close();
            }
            inner.relay = None;
        }

        let transfers = self.transfer_list();
        self.transfers.clear();
        for transfer in transfers {
            transfer.abort();
        }
        info!(remote = %self.remote, "session closed");
        self.events.emit(SessionEvent::Closed);
    }
}

/// Reference the peer's acknowledgement of `envelope` will carry
fn ack_reference(envelope: &Envelope) -> u32 {
    match envelope.header() {
        Header::V1(h) => h.ack_session_id,
        Header::V2(h) => h.identifier.wrapping_add(h.wire_chunk_size()),
    }
}

fn remap_ack(pending: &mut HashMap<u32, u32>, from: u32, to: u32) {
    if from == to {
        return;
    }
    if let Some(reference) = pending.remove(&from) {
        pending.insert(to, reference);
    }
}

fn wants_acknowledgement(envelope: &Envelope) -> bool {
    match envelope.header() {
        Header::V1(h) => h.is_final_chunk(),
        Header::V2(h) => h.operation_code.contains(OperationCode::RAK),
    }
}

impl PacketReceiver for MessageSession {
    fn receive(&self, kind: TransportKind, frame: &[u8]) {
        self.receive_bytes(kind, frame);
    }

    fn transport_closed(&self, kind: TransportKind, unsent: Vec<Vec<u8>>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let slot = match kind {
            TransportKind::Direct => &mut inner.direct,
            TransportKind::Relay => &mut inner.relay,
        };
        let was_assigned = slot.take().is_some();
        if was_assigned {
            warn!(remote = %self.remote, %kind, unsent = unsent.len(), "transport closed");
            self.events.emit(SessionEvent::TransportInvalid(kind));
            self.events.emit(SessionEvent::TransportChanged(inner.active_kind()));
        }
        self.requeue(&mut inner, kind, &unsent);
        if was_assigned || !unsent.is_empty() {
            self.flush(&mut inner);
        }
    }
}

impl std::fmt::Debug for MessageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSession")
            .field("remote", &self.remote)
            .field("version", &self.config.version)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}
