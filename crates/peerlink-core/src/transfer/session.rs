//! Transfer session state machine and data pump.

use super::{
    DataSink, TransferDirection, TransferEvent, TransferKind, TransferProgress, TransferState,
};
use crate::config::TransferConfig;
use crate::envelope::Envelope;
use crate::error::{SessionError, TransferError};
use crate::events::Subscribers;
use crate::header::v1::V1Header;
use crate::header::v2::{OperationCode, TfCombination, V2Header};
use crate::header::{Header, P2PHeader, ProtocolVersion};
use crate::session::MessageSession;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// One logical transfer multiplexed on a [`MessageSession`].
///
/// Outbound data is pumped by a dedicated worker thread; inbound data is
/// written from whichever thread delivers envelopes to the session. The two
/// only share the abort flag and the sink, which is guarded by a lock.
pub struct TransferSession {
    id: u32,
    direction: TransferDirection,
    kind: TransferKind,
    config: TransferConfig,
    session: Weak<MessageSession>,
    state: Mutex<TransferState>,
    sink: Mutex<Option<Box<dyn DataSink>>>,
    bytes_total: AtomicU64,
    bytes_done: AtomicU64,
    abort: AtomicBool,
    direct_requested: AtomicBool,
    invitation_ack: Mutex<Option<u32>>,
    started: Mutex<Option<Instant>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: Subscribers<TransferEvent>,
}

impl TransferSession {
    /// Create a transfer with a freshly allocated session id and register it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session is closed.
    pub fn create(
        session: &Arc<MessageSession>,
        direction: TransferDirection,
        kind: TransferKind,
        sink: Box<dyn DataSink>,
        config: TransferConfig,
    ) -> Result<Arc<Self>, SessionError> {
        let id = session.allocate_session_id();
        Self::with_id(session, id, direction, kind, sink, config)
    }

    /// Create a transfer with an id negotiated by the peer and register it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateTransfer`] if the id is taken and
    /// [`SessionError::Closed`] if the session is closed.
    pub fn with_id(
        session: &Arc<MessageSession>,
        id: u32,
        direction: TransferDirection,
        kind: TransferKind,
        sink: Box<dyn DataSink>,
        config: TransferConfig,
    ) -> Result<Arc<Self>, SessionError> {
        if session.is_closed() {
            return Err(SessionError::Closed);
        }
        let transfer = Arc::new(Self {
            id,
            direction,
            kind,
            config,
            session: Arc::downgrade(session),
            state: Mutex::new(TransferState::Idle),
            sink: Mutex::new(Some(sink)),
            bytes_total: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            abort: AtomicBool::new(false),
            direct_requested: AtomicBool::new(false),
            invitation_ack: Mutex::new(None),
            started: Mutex::new(None),
            worker: Mutex::new(None),
            events: Subscribers::new(),
        });
        session.add_transfer(Arc::clone(&transfer))?;
        Ok(transfer)
    }

    /// Transfer session id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Direction
    #[must_use]
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Kind of payload
    #[must_use]
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TransferState {
        *self.state.lock()
    }

    /// Ack reference of the invitation reply sent by
    /// [`TransferSession::accept_invitation`]
    #[must_use]
    pub fn invitation_ack(&self) -> Option<u32> {
        *self.invitation_ack.lock()
    }

    /// Whether a direct connection was requested for this transfer
    #[must_use]
    pub fn is_direct_requested(&self) -> bool {
        self.direct_requested.load(Ordering::SeqCst)
    }

    /// Receive future transfer events
    pub fn subscribe(&self) -> Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Progress snapshot
    #[must_use]
    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            session_id: self.id,
            bytes_done: self.bytes_done.load(Ordering::SeqCst),
            bytes_total: self.bytes_total.load(Ordering::SeqCst),
            elapsed: self.started.lock().map(|s| s.elapsed()).unwrap_or_default(),
        }
    }

    /// Take the sink back, e.g. after a transfer with `auto_close` disabled
    pub fn take_sink(&self) -> Option<Box<dyn DataSink>> {
        self.sink.lock().take()
    }

    /// Wait for the send worker to exit
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(session_id = self.id, "transfer worker panicked");
            }
        }
    }

    fn set_state(&self, next: TransferState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() || *state == next {
            return false;
        }
        debug!(session_id = self.id, from = %*state, to = %next, "transfer state");
        *state = next;
        drop(state);
        self.events.emit(TransferEvent::StateChanged(next));
        true
    }

    /// Answer the invitation with `reply` and get ready to move data.
    ///
    /// A sending transfer starts pumping immediately unless a direct
    /// connection was requested and is not up yet.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] unless the transfer is idle,
    /// or the session error if the reply cannot be sent.
    pub fn accept_invitation(self: &Arc<Self>, reply: Envelope) -> Result<u32, TransferError> {
        let state = self.state();
        if state != TransferState::Idle {
            return Err(TransferError::InvalidState {
                state,
                operation: "accept_invitation",
            });
        }
        let session = self.session.upgrade().ok_or(TransferError::SessionGone)?;
        let ack = session.send(reply)?;
        *self.invitation_ack.lock() = Some(ack);
        debug!(session_id = self.id, ack, "invitation accepted");
        self.start()?;
        Ok(ack)
    }

    /// Refuse the invitation with `reply`; the transfer is aborted.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] unless the transfer is idle,
    /// or the session error if the reply cannot be sent.
    pub fn decline_invitation(&self, reply: Envelope) -> Result<(), TransferError> {
        let state = self.state();
        if state != TransferState::Idle {
            return Err(TransferError::InvalidState {
                state,
                operation: "decline_invitation",
            });
        }
        let session = self.session.upgrade().ok_or(TransferError::SessionGone)?;
        session.send(reply)?;
        self.abort();
        Ok(())
    }

    /// Hold the data until a direct connection is up.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] once data is moving.
    pub fn request_direct_connection(&self) -> Result<(), TransferError> {
        let state = self.state();
        if state != TransferState::Idle {
            return Err(TransferError::InvalidState {
                state,
                operation: "request_direct_connection",
            });
        }
        self.direct_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Start moving data.
    ///
    /// From `Idle` with a pending direct-connection request the transfer
    /// waits in `AwaitingDirectConnection`. From `AwaitingDirectConnection`
    /// it starts on whatever transport is active. A sending transfer spawns
    /// its worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] once started or finished, and
    /// [`TransferError::Spawn`] if the worker cannot be created.
    pub fn start(self: &Arc<Self>) -> Result<(), TransferError> {
        let session = self.session.upgrade().ok_or(TransferError::SessionGone)?;
        let state = self.state();
        match state {
            TransferState::Idle if self.is_direct_requested() && !session.is_direct() => {
                self.set_state(TransferState::AwaitingDirectConnection);
                return Ok(());
            }
            TransferState::Idle | TransferState::AwaitingDirectConnection => {}
            state => {
                return Err(TransferError::InvalidState {
                    state,
                    operation: "start",
                });
            }
        }

        *self.started.lock() = Some(Instant::now());
        self.set_state(TransferState::Transferring);
        if self.direction == TransferDirection::Receive {
            return Ok(());
        }

        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("transfer-{}", self.id))
            .spawn(move || this.run_send());
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.abort();
                Err(TransferError::Spawn(err.to_string()))
            }
        }
    }

    /// The session's direct socket is up; a waiting transfer starts
    pub fn on_direct_connection_ready(self: &Arc<Self>) {
        if self.state() != TransferState::AwaitingDirectConnection {
            return;
        }
        if let Err(err) = self.start() {
            warn!(session_id = self.id, error = %err, "failed to start transfer");
        }
    }

    /// Stop the transfer; the worker notices at its next iteration
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        if self.set_state(TransferState::Aborted) {
            info!(session_id = self.id, "transfer aborted");
            self.unregister();
            self.events.emit(TransferEvent::Aborted);
        }
    }

    fn finish(&self) {
        if !self.set_state(TransferState::Finished) {
            return;
        }
        let mut sink = self.sink.lock();
        if let Some(s) = sink.as_mut() {
            if let Err(err) = s.flush() {
                warn!(session_id = self.id, error = %err, "failed to flush sink");
            }
        }
        if self.config.auto_close {
            *sink = None;
        }
        drop(sink);

        info!(
            session_id = self.id,
            bytes = self.bytes_done.load(Ordering::SeqCst),
            "transfer finished"
        );
        self.unregister();
        self.events.emit(TransferEvent::Finished);
    }

    fn unregister(&self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_transfer(self.id);
        }
    }

    fn emit_progress(&self) {
        self.events.emit(TransferEvent::Progress(self.progress()));
    }

    fn run_send(&self) {
        match self.pump() {
            Ok(()) if !self.abort.load(Ordering::SeqCst) => self.finish(),
            Ok(()) => self.abort(),
            Err(err) => {
                warn!(session_id = self.id, error = %err, "send worker failed");
                self.abort();
            }
        }
    }

    fn pump(&self) -> Result<(), TransferError> {
        let session = self.session.upgrade().ok_or(TransferError::SessionGone)?;
        let version = session.version();

        let total = {
            let mut sink = self.sink.lock();
            let sink = sink.as_mut().ok_or(TransferError::SinkClosed)?;
            let end = sink.seek(SeekFrom::End(0))?;
            sink.seek(SeekFrom::Start(0))?;
            end
        };
        self.bytes_total.store(total, Ordering::SeqCst);

        if version == ProtocolVersion::V1 && self.kind.is_msn_object() && !session.is_direct() {
            let mut preparation = Envelope::new(ProtocolVersion::V1);
            preparation.header_mut().set_session_id(self.id);
            preparation.set_footer(self.kind.app_id());
            trace!(session_id = self.id, "sending preparation message");
            session.send(preparation)?;
        }

        let identifier = match version {
            ProtocolVersion::V1 => session.next_identifier(),
            ProtocolVersion::V2 => 0,
        };
        let package = match version {
            ProtocolVersion::V1 => 0,
            ProtocolVersion::V2 => session.next_package_number(),
        };

        let mut offset = 0u64;
        let mut buf = Vec::new();
        while offset < total {
            if self.abort.load(Ordering::SeqCst) {
                debug!(session_id = self.id, offset, "abort observed");
                return Ok(());
            }

            buf.resize(session.max_payload(), 0);
            let read = {
                let mut sink = self.sink.lock();
                let sink = sink.as_mut().ok_or(TransferError::SinkClosed)?;
                read_full(sink, &mut buf)?
            };
            if read == 0 {
                warn!(session_id = self.id, offset, total, "source ended early");
                break;
            }
            if self.abort.load(Ordering::SeqCst) {
                debug!(session_id = self.id, offset, "abort observed after read");
                return Ok(());
            }

            let chunk = buf[..read].to_vec();
            let envelope = self.data_envelope(version, identifier, package, offset, total, chunk);
            session.send(envelope)?;

            offset += read as u64;
            self.bytes_done.store(offset, Ordering::SeqCst);
            self.emit_progress();

            if !self.config.pacing.is_zero() {
                std::thread::sleep(self.config.pacing);
            }
        }
        Ok(())
    }

    fn data_envelope(
        &self,
        version: ProtocolVersion,
        identifier: u32,
        package: u16,
        offset: u64,
        total: u64,
        chunk: Vec<u8>,
    ) -> Envelope {
        let end = offset + chunk.len() as u64;
        match version {
            ProtocolVersion::V1 => {
                let header = V1Header {
                    session_id: self.id,
                    identifier,
                    offset,
                    total_size: total,
                    flags: self.kind.v1_flags(),
                    ..V1Header::default()
                };
                let mut envelope = Envelope::from_parts(Header::V1(header), chunk);
                envelope.set_footer(self.kind.app_id());
                envelope
            }
            ProtocolVersion::V2 => {
                let op = if end >= total {
                    OperationCode::RAK
                } else {
                    OperationCode::NONE
                };
                let mut header = V2Header::new(op);
                let dh = header.data_header_mut();
                dh.tf_combination = self.kind.tf_combination();
                if offset == 0 {
                    dh.tf_combination.insert(TfCombination::FIRST);
                }
                dh.package_number = package;
                dh.session_id = self.id;
                dh.set_data_remaining(total.saturating_sub(end));
                Envelope::from_parts(Header::V2(header), chunk)
            }
        }
    }

    /// Handle an inbound envelope addressed to this transfer
    pub fn handle_envelope(&self, envelope: &Envelope) {
        if envelope.session_id() != self.id {
            warn!(
                session_id = self.id,
                got = envelope.session_id(),
                "envelope for another transfer"
            );
            return;
        }
        if envelope.is_error() {
            warn!(session_id = self.id, "peer reported a transfer error");
            self.abort();
            return;
        }
        if self.state().is_terminal() {
            trace!(session_id = self.id, "envelope after completion ignored");
            return;
        }
        if envelope.payload().is_empty() {
            trace!(session_id = self.id, "preparation message received");
            return;
        }
        if self.direction == TransferDirection::Send {
            warn!(session_id = self.id, "data received on an outbound transfer");
            return;
        }
        if !self.chunk_in_range(envelope) {
            warn!(session_id = self.id, "chunk outside the transfer, discarding");
            return;
        }

        let done = match self.write_chunk(envelope) {
            Ok(done) => done,
            Err(err) => {
                warn!(session_id = self.id, error = %err, "failed to write sink");
                self.abort();
                return;
            }
        };

        if self.started.lock().is_none() {
            *self.started.lock() = Some(Instant::now());
        }
        self.set_state(TransferState::Transferring);
        self.emit_progress();
        if done {
            self.finish();
        }
    }

    /// Whether the chunk's position fits in 64 bits and, for V1, inside the
    /// declared total
    fn chunk_in_range(&self, envelope: &Envelope) -> bool {
        let len = envelope.payload().len() as u64;
        match envelope.header() {
            Header::V1(h) => h.offset.checked_add(len).is_some_and(|end| end <= h.total_size),
            Header::V2(h) => self
                .bytes_done
                .load(Ordering::SeqCst)
                .checked_add(len)
                .and_then(|done| done.checked_add(h.data_remaining()))
                .is_some(),
        }
    }

    fn write_chunk(&self, envelope: &Envelope) -> Result<bool, TransferError> {
        let payload = envelope.payload();
        let len = payload.len() as u64;
        let mut sink = self.sink.lock();
        let sink = sink.as_mut().ok_or(TransferError::SinkClosed)?;

        let done = match envelope.header() {
            Header::V1(h) => {
                sink.seek(SeekFrom::Start(h.offset))?;
                sink.write_all(payload)?;
                self.bytes_total.store(h.total_size, Ordering::SeqCst);
                h.offset.saturating_add(len) >= h.total_size
            }
            Header::V2(h) => {
                let done_before = self.bytes_done.load(Ordering::SeqCst);
                if h.tf_combination().contains(TfCombination::FIRST) {
                    let total = done_before.saturating_add(len).saturating_add(h.data_remaining());
                    self.bytes_total.store(total, Ordering::SeqCst);
                }
                sink.write_all(payload)?;
                h.data_remaining() == 0
            }
        };
        self.bytes_done.fetch_add(len, Ordering::SeqCst);
        Ok(done)
    }
}

fn read_full(source: &mut dyn DataSink, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::envelope::AppId;
    use crate::header::v1::V1Flags;
    use crate::transport::{Transport, TransportKind, TransportResult};
    use std::io::Cursor;
    use std::time::Duration;

    struct RecordingTransport {
        kind: TransportKind,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn send(&self, frame: &[u8]) -> TransportResult<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }

        fn close(&self) {}
    }

    fn recorder(kind: TransportKind) -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            kind,
            frames: Mutex::new(Vec::new()),
        })
    }

    /// Sink whose contents stay reachable after the transfer drops it
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Cursor<Vec<u8>>>>);

    impl SharedBuffer {
        fn contents(&self) -> Vec<u8> {
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

    fn unpaced() -> TransferConfig {
        TransferConfig {
            pacing: Duration::ZERO,
            auto_close: true,
        }
    }

    fn source(len: usize) -> Box<dyn DataSink> {
        Box::new(Cursor::new((0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>()))
    }

    fn relay_session(
        version: ProtocolVersion,
        seed: u64,
    ) -> (Arc<MessageSession>, Arc<RecordingTransport>) {
        let session =
            MessageSession::new("peer", SessionConfig::for_version(version).with_seed(seed));
        let relay = recorder(TransportKind::Relay);
        session.set_relay_transport(Some(relay.clone()));
        (session, relay)
    }

    #[test]
    fn test_v1_file_chunks_at_relay_ceiling() {
        let (session, relay) = relay_session(ProtocolVersion::V1, 1);
        let transfer = TransferSession::create(
            &session,
            TransferDirection::Send,
            TransferKind::File,
            source(5000),
            unpaced(),
        )
        .unwrap();
        transfer.start().unwrap();
        transfer.join();
        assert_eq!(transfer.state(), TransferState::Finished);

        let sent: Vec<Envelope> = relay
            .frames
            .lock()
            .iter()
            .map(|f| Envelope::parse(ProtocolVersion::V1, f, TransportKind::Relay).unwrap())
            .collect();
        let offsets: Vec<u64> = sent.iter().map(|e| e.header().as_v1().unwrap().offset).collect();
        let lengths: Vec<usize> = sent.iter().map(|e| e.payload().len()).collect();
        assert_eq!(offsets, vec![0, 1202, 2404, 3606, 4808]);
        assert_eq!(lengths, vec![1202, 1202, 1202, 1202, 192]);

        let first = sent[0].header().as_v1().unwrap();
        assert!(sent.iter().all(|e| e.identifier() == first.identifier));
        assert!(sent.iter().all(|e| e.session_id() == transfer.id()));
        assert_eq!(first.flags, V1Flags::FILE_DATA);
        assert_eq!(sent[0].footer(), TransferKind::File.app_id());
        assert!(session.transfer(transfer.id()).is_none());
    }

    #[test]
    fn test_v1_msn_object_preparation_on_relay() {
        let (session, relay) = relay_session(ProtocolVersion::V1, 2);
        let transfer = TransferSession::create(
            &session,
            TransferDirection::Send,
            TransferKind::CustomEmoticon,
            source(100),
            unpaced(),
        )
        .unwrap();
        transfer.start().unwrap();
        transfer.join();

        let frames = relay.frames.lock();
        assert_eq!(frames.len(), 2);
        let prep = Envelope::parse(ProtocolVersion::V1, &frames[0], TransportKind::Relay).unwrap();
        assert!(prep.payload().is_empty());
        assert_eq!(prep.session_id(), transfer.id());
        assert_eq!(prep.footer(), AppId::CUSTOM_EMOTICON);
        let data = Envelope::parse(ProtocolVersion::V1, &frames[1], TransportKind::Relay).unwrap();
        assert_eq!(data.payload().len(), 100);
        assert_eq!(data.footer(), AppId::CUSTOM_EMOTICON);
    }

    #[test]
    fn test_v1_receive_writes_at_offsets() {
        let (sender, relay) = relay_session(ProtocolVersion::V1, 3);
        let receiver = MessageSession::new("sender", SessionConfig::default().with_seed(4));
        let out = SharedBuffer::default();

        let outbound = TransferSession::create(
            &sender,
            TransferDirection::Send,
            TransferKind::File,
            source(3000),
            unpaced(),
        )
        .unwrap();
        let inbound = TransferSession::with_id(
            &receiver,
            outbound.id(),
            TransferDirection::Receive,
            TransferKind::File,
            Box::new(out.clone()),
            unpaced(),
        )
        .unwrap();
        let events = inbound.subscribe();
        inbound.start().unwrap();

        outbound.start().unwrap();
        outbound.join();
        for frame in relay.frames.lock().iter() {
            receiver.receive_bytes(TransportKind::Relay, frame);
        }

        assert_eq!(inbound.state(), TransferState::Finished);
        let expected: Vec<u8> = (0..3000).map(|i| (i % 253) as u8).collect();
        assert_eq!(out.contents(), expected);
        assert!(events.try_iter().any(|e| e == TransferEvent::Finished));
        assert_eq!(inbound.progress().bytes_done, 3000);
    }

    #[test]
    fn test_v2_round_trip_with_remaining() {
        let (sender, relay) = relay_session(ProtocolVersion::V2, 5);
        let receiver = MessageSession::new(
            "sender",
            SessionConfig::for_version(ProtocolVersion::V2).with_seed(6),
        );
        let out = SharedBuffer::default();

        let outbound = TransferSession::create(
            &sender,
            TransferDirection::Send,
            TransferKind::File,
            source(2500),
            unpaced(),
        )
        .unwrap();
        let inbound = TransferSession::with_id(
            &receiver,
            outbound.id(),
            TransferDirection::Receive,
            TransferKind::File,
            Box::new(out.clone()),
            unpaced(),
        )
        .unwrap();

        outbound.start().unwrap();
        outbound.join();
        let frames = relay.frames.lock().clone();
        let first = Envelope::parse(ProtocolVersion::V2, &frames[0], TransportKind::Relay).unwrap();
        let h = first.header().as_v2().unwrap();
        assert!(h.tf_combination().contains(TfCombination::FIRST));
        assert_eq!(h.data_remaining(), 2500 - 1202);
        let last =
            Envelope::parse(ProtocolVersion::V2, &frames[frames.len() - 1], TransportKind::Relay)
                .unwrap();
        assert!(last.header().as_v2().unwrap().operation_code.contains(OperationCode::RAK));

        for frame in &frames {
            receiver.receive_bytes(TransportKind::Relay, frame);
        }
        assert_eq!(inbound.state(), TransferState::Finished);
        assert_eq!(out.contents().len(), 2500);
        assert_eq!(inbound.progress().bytes_total, 2500);
    }

    #[test]
    fn test_error_envelope_aborts_receiver() {
        let session = MessageSession::new("peer", SessionConfig::default().with_seed(7));
        let inbound = TransferSession::with_id(
            &session,
            60_001,
            TransferDirection::Receive,
            TransferKind::File,
            Box::new(SharedBuffer::default()),
            unpaced(),
        )
        .unwrap();
        let events = inbound.subscribe();

        let mut envelope = Envelope::new(ProtocolVersion::V1);
        if let Some(h) = envelope.header_mut().as_v1_mut() {
            h.session_id = 60_001;
            h.flags = V1Flags::ERROR;
        }
        inbound.handle_envelope(&envelope);
        assert_eq!(inbound.state(), TransferState::Aborted);
        assert!(events.try_iter().any(|e| e == TransferEvent::Aborted));
        assert!(session.transfer(60_001).is_none());
    }

    #[test]
    fn test_abort_before_start() {
        let (session, relay) = relay_session(ProtocolVersion::V1, 8);
        let transfer = TransferSession::create(
            &session,
            TransferDirection::Send,
            TransferKind::File,
            source(5000),
            unpaced(),
        )
        .unwrap();
        transfer.abort();
        assert_eq!(transfer.state(), TransferState::Aborted);
        assert!(matches!(
            transfer.start(),
            Err(TransferError::InvalidState {
                state: TransferState::Aborted,
                ..
            })
        ));
        assert!(relay.frames.lock().is_empty());
    }

    /// Source that reports each read and then waits for the gate to open
    struct GatedSource {
        data: Cursor<Vec<u8>>,
        started: crossbeam_channel::Sender<()>,
        gate: crossbeam_channel::Receiver<()>,
    }

    impl Read for GatedSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.started.send(());
            // a dropped gate lets every later read through
            let _ = self.gate.recv();
            self.data.read(buf)
        }
    }

    impl Write for GatedSource {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for GatedSource {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.data.seek(pos)
        }
    }

    #[test]
    fn test_abort_mid_stream_stops_sending() {
        let (session, relay) = relay_session(ProtocolVersion::V1, 12);
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let source = GatedSource {
            data: Cursor::new(vec![3u8; 5000]),
            started: started_tx,
            gate: gate_rx,
        };
        let transfer = TransferSession::create(
            &session,
            TransferDirection::Send,
            TransferKind::File,
            Box::new(source),
            unpaced(),
        )
        .unwrap();
        let events = transfer.subscribe();
        transfer.start().unwrap();

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        gate_tx.send(()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        transfer.abort();
        gate_tx.send(()).unwrap();
        drop(gate_tx);
        transfer.join();

        assert_eq!(relay.frames.lock().len(), 1);
        assert_eq!(transfer.state(), TransferState::Aborted);
        assert!(transfer.progress().bytes_done < 5000);
        let seen: Vec<TransferEvent> = events.try_iter().collect();
        assert_eq!(seen.iter().filter(|e| **e == TransferEvent::Aborted).count(), 1);
        assert!(!seen.contains(&TransferEvent::Finished));
        assert!(session.transfer(transfer.id()).is_none());
    }

    #[test]
    fn test_hostile_offset_discarded_without_abort() {
        let session = MessageSession::new("peer", SessionConfig::default().with_seed(13));
        let out = SharedBuffer::default();
        let inbound = TransferSession::with_id(
            &session,
            60_002,
            TransferDirection::Receive,
            TransferKind::File,
            Box::new(out.clone()),
            unpaced(),
        )
        .unwrap();
        inbound.start().unwrap();

        let mut envelope = Envelope::new(ProtocolVersion::V1);
        envelope.set_payload(vec![1; 16]);
        if let Some(h) = envelope.header_mut().as_v1_mut() {
            h.session_id = 60_002;
            h.offset = u64::MAX - 4;
            h.total_size = 64;
        }
        inbound.handle_envelope(&envelope);

        assert_eq!(inbound.state(), TransferState::Transferring);
        assert_eq!(inbound.progress().bytes_done, 0);
        assert!(out.contents().is_empty());
    }

    #[test]
    fn test_direct_request_defers_until_ready() {
        let (session, relay) = relay_session(ProtocolVersion::V1, 9);
        let transfer = TransferSession::create(
            &session,
            TransferDirection::Send,
            TransferKind::File,
            source(2000),
            unpaced(),
        )
        .unwrap();
        transfer.request_direct_connection().unwrap();

        let reply = Envelope::new(ProtocolVersion::V1);
        let ack = transfer.accept_invitation(reply).unwrap();
        assert_eq!(transfer.invitation_ack(), Some(ack));
        assert_eq!(transfer.state(), TransferState::AwaitingDirectConnection);
        assert_eq!(relay.frames.lock().len(), 1);

        let direct = recorder(TransportKind::Direct);
        session.set_direct_transport(Some(direct.clone()));
        transfer.join();
        assert_eq!(transfer.state(), TransferState::Finished);

        let lengths: Vec<usize> = direct
            .frames
            .lock()
            .iter()
            .map(|f| {
                Envelope::parse(ProtocolVersion::V1, f, TransportKind::Direct)
                    .unwrap()
                    .header()
                    .payload_len() as usize
            })
            .collect();
        assert_eq!(lengths, vec![1352, 648]);
    }

    #[test]
    fn test_sends_from_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[7u8; 4000]).unwrap();

        let (session, relay) = relay_session(ProtocolVersion::V2, 11);
        let transfer = TransferSession::create(
            &session,
            TransferDirection::Send,
            TransferKind::File,
            Box::new(file),
            unpaced(),
        )
        .unwrap();
        let events = transfer.subscribe();
        transfer.start().unwrap();
        transfer.join();

        assert_eq!(relay.frames.lock().len(), 4);
        let progress: Vec<u64> = events
            .try_iter()
            .filter_map(|e| match e {
                TransferEvent::Progress(p) => Some(p.bytes_done),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1202, 2404, 3606, 4000]);
    }

    #[test]
    fn test_accept_twice_rejected() {
        let (session, _relay) = relay_session(ProtocolVersion::V1, 10);
        let transfer = TransferSession::create(
            &session,
            TransferDirection::Receive,
            TransferKind::File,
            Box::new(SharedBuffer::default()),
            unpaced(),
        )
        .unwrap();
        transfer.accept_invitation(Envelope::new(ProtocolVersion::V1)).unwrap();
        assert_eq!(transfer.state(), TransferState::Transferring);
        assert!(transfer.accept_invitation(Envelope::new(ProtocolVersion::V1)).is_err());
    }
}
