//! Authenticated direct TCP connections.
//!
//! A [`DirectListener`] or [`connect`] opens the socket and drives the
//! [`DirectHandshake`] state machine over length-prefixed frames. Only once
//! the handshake reached `Established` is the socket handed out as a
//! [`DirectConnection`], which becomes a [`DirectTransport`] when attached
//! to a [`PacketReceiver`].
//!
//! Inbound frames are read by a tokio task and delivered to the receiver
//! from a dedicated `direct-rx` thread, so a receiver may block (sink I/O,
//! back-pressure) without stalling the runtime.
//!
//! `send` only queues a frame for the writer task. When the socket fails,
//! the frames still queued (and the one whose write failed) are handed back
//! through [`PacketReceiver::transport_closed`].

use crate::framing::{DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE, read_frame, write_frame};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use peerlink_core::{
    DirectHandshake, HandshakeAction, HandshakeConfig, HandshakeRole, Nonce, PacketReceiver,
    ProtocolVersion, Transport, TransportError, TransportKind, TransportResult, TransportStats,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Time a listener waits for a peer before giving up
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(12);

/// Direct socket configuration
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Deadline for a connection (and its handshake) to arrive
    pub listen_timeout: Duration,
    /// Largest frame body accepted from the peer
    pub max_frame_size: usize,
    /// Set `TCP_NODELAY` on the socket
    pub nodelay: bool,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            listen_timeout: LISTEN_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            nodelay: true,
        }
    }
}

/// Listening side of a direct connection
pub struct DirectListener {
    listener: TcpListener,
    config: DirectConfig,
}

impl DirectListener {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, config: DirectConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "direct listener bound");
        Ok(Self { listener, config })
    }

    /// Local address, e.g. to advertise in an invitation
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket has no local address.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for one peer and authenticate it, answering a valid handshake
    /// automatically.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ListenTimeout`] if no authenticated peer
    /// arrives within the listen timeout and [`TransportError::Handshake`]
    /// if the peer fails validation.
    pub async fn accept(self, handshake: HandshakeConfig) -> TransportResult<DirectConnection> {
        self.accept_with(handshake, |_| true).await
    }

    /// Like [`DirectListener::accept`], asking `approve` about a valid
    /// handshake when `auto_handshake` is off.
    ///
    /// # Errors
    ///
    /// As [`DirectListener::accept`]; a refused handshake yields
    /// [`TransportError::ConnectionFailed`].
    pub async fn accept_with<F>(
        self,
        handshake: HandshakeConfig,
        approve: F,
    ) -> TransportResult<DirectConnection>
    where
        F: FnOnce(&Nonce) -> bool + Send,
    {
        if handshake.role != HandshakeRole::Listener {
            return Err(TransportError::InvalidConfig(
                "listener needs a listener handshake".into(),
            ));
        }
        let version = handshake.version;
        let deadline = self.config.listen_timeout;
        let config = self.config;
        let listener = self.listener;

        let attempt = async move {
            let mut machine = DirectHandshake::new(handshake);
            machine.start();
            let (mut stream, peer) = listener.accept().await?;
            stream.set_nodelay(config.nodelay)?;
            info!(%peer, "direct socket accepted");
            machine.on_accepted();

            drive_handshake(&mut stream, &mut machine, Vec::new(), approve, config.max_frame_size)
                .await?;
            Ok::<_, TransportError>(DirectConnection::new(stream, peer, version, &machine, config))
        };

        match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?deadline, "no direct connection, listener closed");
                Err(TransportError::ListenTimeout)
            }
        }
    }
}

impl std::fmt::Debug for DirectListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

/// Open a socket to `addr` and authenticate it.
///
/// # Errors
///
/// Returns [`TransportError::ConnectionFailed`] if the socket cannot be
/// opened and [`TransportError::Handshake`] if validation fails.
pub async fn connect(
    addr: SocketAddr,
    handshake: HandshakeConfig,
    config: DirectConfig,
) -> TransportResult<DirectConnection> {
    if handshake.role != HandshakeRole::Connector {
        return Err(TransportError::InvalidConfig(
            "connect needs a connector handshake".into(),
        ));
    }
    let version = handshake.version;
    let mut machine = DirectHandshake::new(handshake);
    machine.start();

    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
    stream.set_nodelay(config.nodelay)?;
    info!(peer = %addr, "direct socket connected");

    let initial = machine.on_connected()?;
    drive_handshake(&mut stream, &mut machine, initial, |_| true, config.max_frame_size).await?;
    Ok(DirectConnection::new(stream, addr, version, &machine, config))
}

async fn drive_handshake<F>(
    stream: &mut TcpStream,
    machine: &mut DirectHandshake,
    initial: Vec<HandshakeAction>,
    approve: F,
    max_frame_size: usize,
) -> TransportResult<()>
where
    F: FnOnce(&Nonce) -> bool,
{
    let mut pending: VecDeque<HandshakeAction> = initial.into();
    let mut approve = Some(approve);

    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                HandshakeAction::Send(body) => write_frame(stream, &body).await?,
                HandshakeAction::Established => return Ok(()),
                HandshakeAction::Surface(nonce) => {
                    if approve.take().is_some_and(|f| f(&nonce)) {
                        pending.extend(machine.accept()?);
                    } else {
                        machine.reject();
                        return Err(TransportError::ConnectionFailed(
                            "handshake refused".into(),
                        ));
                    }
                }
            }
        }

        let Some(frame) = read_frame(stream, max_frame_size).await? else {
            return Err(TransportError::ConnectionFailed(
                "peer closed during handshake".into(),
            ));
        };
        trace!(len = frame.len(), state = ?machine.state(), "handshake frame");
        pending.extend(machine.on_frame(&frame)?);
    }
}

/// An authenticated socket not yet carrying envelopes
pub struct DirectConnection {
    stream: TcpStream,
    peer: SocketAddr,
    version: ProtocolVersion,
    peer_nonce: Option<Nonce>,
    config: DirectConfig,
    runtime: Handle,
}

impl DirectConnection {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        version: ProtocolVersion,
        machine: &DirectHandshake,
        config: DirectConfig,
    ) -> Self {
        info!(%peer, role = ?machine.role(), "direct connection established");
        Self {
            stream,
            peer,
            version,
            peer_nonce: machine.peer_nonce(),
            config,
            runtime: Handle::current(),
        }
    }

    /// Peer address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Wire format negotiated by the handshake
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Nonce the peer presented
    #[must_use]
    pub fn peer_nonce(&self) -> Option<Nonce> {
        self.peer_nonce
    }

    /// Start moving envelopes; inbound frames go to `receiver`.
    ///
    /// Spawns the socket tasks on the runtime the connection was made on
    /// and a delivery thread, so this may be called from any thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the delivery thread cannot be spawned.
    pub fn attach(
        self,
        receiver: Weak<dyn PacketReceiver>,
    ) -> TransportResult<Arc<DirectTransport>> {
        let (read_half, write_half) = self.stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gone_tx, gone_rx) = oneshot::channel();
        let (deliver_tx, deliver_rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(TransportStats::default()));

        std::thread::Builder::new()
            .name("direct-rx".into())
            .spawn(move || deliver(deliver_rx, receiver))?;

        self.runtime.spawn(write_loop(
            write_half,
            out_rx,
            shutdown_rx.clone(),
            gone_rx,
            Arc::clone(&connected),
            Arc::clone(&stats),
            deliver_tx.clone(),
        ));
        self.runtime.spawn(read_loop(
            read_half,
            self.config.max_frame_size,
            shutdown_rx,
            gone_tx,
            Arc::clone(&stats),
            deliver_tx,
        ));

        Ok(Arc::new(DirectTransport {
            peer: self.peer,
            outbound: out_tx,
            shutdown: shutdown_tx,
            connected,
            stats,
        }))
    }
}

impl std::fmt::Debug for DirectConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectConnection")
            .field("peer", &self.peer)
            .field("version", &self.version)
            .finish()
    }
}

enum Delivery {
    Frame(Vec<u8>),
    /// Lost connection with the frames never written
    Closed(Vec<Vec<u8>>),
}

fn deliver(inbox: Receiver<Delivery>, receiver: Weak<dyn PacketReceiver>) {
    for delivery in inbox {
        let Some(receiver) = receiver.upgrade() else {
            return;
        };
        match delivery {
            Delivery::Frame(frame) => receiver.receive(TransportKind::Direct, &frame),
            Delivery::Closed(unsent) => {
                receiver.transport_closed(TransportKind::Direct, unsent);
                return;
            }
        }
    }
}

/// Report a failure the local side did not initiate, handing back
/// `failed` and every frame still queued
fn report_lost(
    failed: Option<Vec<u8>>,
    outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    connected: &AtomicBool,
    deliver: &Sender<Delivery>,
) {
    outbound.close();
    let mut unsent: Vec<Vec<u8>> = failed.into_iter().collect();
    while let Ok(frame) = outbound.try_recv() {
        unsent.push(frame);
    }
    if connected.swap(false, Ordering::SeqCst) {
        let _ = deliver.send(Delivery::Closed(unsent));
    }
}

/// Write queued frames until shutdown or loss. The writer alone reports a
/// lost connection; the reader signals it through `gone`.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
    mut gone: oneshot::Receiver<()>,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<TransportStats>>,
    deliver: Sender<Delivery>,
) where
    W: AsyncWrite + Unpin,
{
    let mut reader_done = false;
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = write_frame(&mut writer, &frame).await {
                    warn!(error = %err, "direct socket write failed");
                    stats.lock().record_send_error();
                    report_lost(Some(frame), &mut outbound, &connected, &deliver);
                    break;
                }
                stats.lock().record_send(frame.len() + LENGTH_PREFIX_SIZE);
            }
            signal = &mut gone, if !reader_done => {
                reader_done = true;
                if signal.is_ok() {
                    report_lost(None, &mut outbound, &connected, &deliver);
                    break;
                }
            }
            _ = shutdown.changed() => {}
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
    gone: oneshot::Sender<()>,
    stats: Arc<Mutex<TransportStats>>,
    deliver: Sender<Delivery>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            frame = read_frame(&mut reader, max_frame_size) => match frame {
                Ok(Some(frame)) => {
                    stats.lock().record_recv(frame.len());
                    if deliver.send(Delivery::Frame(frame)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!("direct socket closed by peer");
                    let _ = gone.send(());
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "direct socket read failed");
                    stats.lock().record_recv_error();
                    let _ = gone.send(());
                    return;
                }
            },
            _ = shutdown.changed() => {}
        }
    }
}

/// Authenticated direct socket carrying envelopes
pub struct DirectTransport {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<TransportStats>>,
}

impl DirectTransport {
    /// Peer address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        if u32::try_from(frame.len()).is_err() {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        self.outbound.send(frame.to_vec()).map_err(|_| {
            self.stats.lock().record_send_error();
            TransportError::Closed
        })
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(peer = %self.peer, "closing direct transport");
        }
        let _ = self.shutdown.send(true);
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::{IdGenerator, NonceAuth};

    struct Inbox {
        frames: Sender<Vec<u8>>,
        closed: AtomicBool,
        unsent: Mutex<Vec<Vec<u8>>>,
    }

    impl PacketReceiver for Inbox {
        fn receive(&self, kind: TransportKind, frame: &[u8]) {
            assert_eq!(kind, TransportKind::Direct);
            let _ = self.frames.send(frame.to_vec());
        }

        fn transport_closed(&self, _kind: TransportKind, unsent: Vec<Vec<u8>>) {
            self.unsent.lock().extend(unsent);
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn inbox() -> (Arc<Inbox>, Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Arc::new(Inbox {
                frames: tx,
                closed: AtomicBool::new(false),
                unsent: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    fn weak(inbox: &Arc<Inbox>) -> Weak<dyn PacketReceiver> {
        let weak: Weak<Inbox> = Arc::downgrade(inbox);
        weak
    }

    fn nonce(seed: u64) -> Nonce {
        Nonce::random(&mut IdGenerator::with_seed(seed))
    }

    async fn establish(
        version: ProtocolVersion,
        listen_auth: NonceAuth,
        connect_auth: NonceAuth,
    ) -> (TransportResult<DirectConnection>, TransportResult<DirectConnection>) {
        let listener = DirectListener::bind("127.0.0.1:0".parse().unwrap(), DirectConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(listener.accept(HandshakeConfig::listener(version, listen_auth)));
        let connected = connect(
            addr,
            HandshakeConfig::connector(version, connect_auth),
            DirectConfig::default(),
        )
        .await;
        (accept.await.unwrap(), connected)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_and_frames_v1() {
        let shared = nonce(1);
        let (server, client) = establish(
            ProtocolVersion::V1,
            NonceAuth::plain(shared),
            NonceAuth::plain(shared),
        )
        .await;
        let server = server.unwrap();
        let client = client.unwrap();
        assert_eq!(server.peer_nonce(), Some(shared));

        let (server_inbox, server_rx) = inbox();
        let (client_inbox, _client_rx) = inbox();
        let _server_t = server.attach(weak(&server_inbox)).unwrap();
        let client_t = client.attach(weak(&client_inbox)).unwrap();

        client_t.send(b"envelope one").unwrap();
        client_t.send(b"envelope two").unwrap();
        let received = tokio::task::spawn_blocking(move || {
            let a = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let b = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            (a, b)
        })
        .await
        .unwrap();
        assert_eq!(received, (b"envelope one".to_vec(), b"envelope two".to_vec()));
        assert_eq!(client_t.stats().frames_sent, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hashed_nonce_v2() {
        let shared = nonce(2);
        let (server, client) = establish(
            ProtocolVersion::V2,
            NonceAuth::from_hash(shared.hashed()),
            NonceAuth::hashed(shared),
        )
        .await;
        assert!(server.is_ok());
        assert!(client.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nonce_mismatch_fails() {
        let (server, client) = establish(
            ProtocolVersion::V1,
            NonceAuth::plain(nonce(3)),
            NonceAuth::plain(nonce(4)),
        )
        .await;
        assert!(matches!(server, Err(TransportError::Handshake(_))));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_listen_timeout() {
        let config = DirectConfig {
            listen_timeout: Duration::from_millis(50),
            ..DirectConfig::default()
        };
        let listener = DirectListener::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        let result = listener
            .accept(HandshakeConfig::listener(
                ProtocolVersion::V1,
                NonceAuth::plain(nonce(5)),
            ))
            .await;
        assert!(matches!(result, Err(TransportError::ListenTimeout)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_reported() {
        let shared = nonce(6);
        let (server, client) = establish(
            ProtocolVersion::V2,
            NonceAuth::plain(shared),
            NonceAuth::plain(shared),
        )
        .await;
        let (server_inbox, _rx) = inbox();
        let server_t = server.unwrap().attach(weak(&server_inbox)).unwrap();
        drop(client);

        for _ in 0..100 {
            if server_inbox.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(server_inbox.closed.load(Ordering::SeqCst));
        assert!(!server_t.is_connected());
        assert!(matches!(server_t.send(b"late"), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_write_returns_queued_frames() {
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        for body in [&b"first"[..], b"second", b"third"] {
            out_tx.send(body.to_vec()).unwrap();
        }
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_gone_tx, gone_rx) = oneshot::channel();
        let (deliver_tx, deliver_rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(TransportStats::default()));

        write_loop(
            local,
            out_rx,
            shutdown_rx,
            gone_rx,
            Arc::clone(&connected),
            Arc::clone(&stats),
            deliver_tx,
        )
        .await;

        assert!(!connected.load(Ordering::SeqCst));
        assert!(out_tx.send(b"late".to_vec()).is_err());
        match deliver_rx.try_recv() {
            Ok(Delivery::Closed(unsent)) => assert_eq!(
                unsent,
                vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
            ),
            _ => panic!("expected the queued frames back"),
        }
        assert_eq!(stats.lock().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_reader_loss_returns_queued_frames() {
        let (local, _remote) = tokio::io::duplex(64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gone_tx, gone_rx) = oneshot::channel();
        let (deliver_tx, deliver_rx) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(TransportStats::default()));

        gone_tx.send(()).unwrap();
        let writer = tokio::spawn(write_loop(
            local,
            out_rx,
            shutdown_rx,
            gone_rx,
            Arc::clone(&connected),
            stats,
            deliver_tx,
        ));
        writer.await.unwrap();

        assert!(!connected.load(Ordering::SeqCst));
        assert!(out_tx.send(b"late".to_vec()).is_err());
        assert!(matches!(deliver_rx.try_recv(), Ok(Delivery::Closed(unsent)) if unsent.is_empty()));
    }

    #[tokio::test]
    async fn test_wrong_role_rejected() {
        let result = connect(
            "127.0.0.1:9".parse().unwrap(),
            HandshakeConfig::listener(ProtocolVersion::V1, NonceAuth::plain(nonce(7))),
            DirectConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }
}
