//! Direct-connection handshake.
//!
//! A freshly opened socket is not trusted until both sides have proven
//! knowledge of the 128-bit nonce exchanged over the signaling channel.
//!
//! ```text
//! connector                                  listener
//!    │ ── "foo\0" greeting ──────────────────▶ │  (skipped unless strict)
//!    │ ── handshake(nonce) ──────────────────▶ │  validate
//!    │ ◀───────────────────── handshake echo ─ │  (auto) or caller accepts
//!    ▼ Established                             ▼ Established
//! ```
//!
//! In hashed mode the invitation only carried `sha1(nonce)[..16]`; the
//! connector still sends the raw nonce and each side compares the hash of
//! what it received with the value it expects.
//!
//! The state machine performs no I/O. It consumes frame bodies and returns
//! [`HandshakeAction`]s; the socket owner adds the length prefix.

use crate::error::HandshakeError;
use crate::header::ProtocolVersion;
use crate::header::v1::{V1Flags, V1Header};
use crate::ids::IdGenerator;
use crate::{NONCE_SIZE, V1_HEADER_SIZE};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Body of the greeting frame sent before the handshake
pub const GREETING: [u8; 4] = *b"foo\0";

/// 128-bit direct-connection nonce
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Wrap raw octets
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw octets
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Random nonce
    #[must_use]
    pub fn random(ids: &mut IdGenerator) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        ids.fill(&mut bytes);
        Self(bytes)
    }

    /// First 16 octets of the SHA-1 digest
    #[must_use]
    pub fn hashed(&self) -> Self {
        let digest = Sha1::digest(self.0);
        let mut bytes = [0u8; NONCE_SIZE];
        bytes.copy_from_slice(&digest[..NONCE_SIZE]);
        Self(bytes)
    }

    /// Whether the nonce is all zeroes
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; NONCE_SIZE]
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({self})")
    }
}

impl FromStr for Nonce {
    type Err = hex::FromHexError;

    /// Accepts plain hex or GUID notation (`{xxxxxxxx-xxxx-...}`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .chars()
            .filter(|c| !matches!(c, '{' | '}' | '-'))
            .collect();
        let mut bytes = [0u8; NONCE_SIZE];
        hex::decode_to_slice(digits, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// How nonces are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceMode {
    /// Compare the received nonce directly
    #[default]
    Plain,
    /// Compare the SHA-1 fingerprint of the received nonce
    Hashed,
}

/// What this side knows about the nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceAuth {
    mode: NonceMode,
    raw: Option<Nonce>,
    expected: Nonce,
}

impl NonceAuth {
    /// Plain nonce known to both sides
    #[must_use]
    pub fn plain(nonce: Nonce) -> Self {
        Self {
            mode: NonceMode::Plain,
            raw: Some(nonce),
            expected: nonce,
        }
    }

    /// Raw nonce, compared in hashed form
    #[must_use]
    pub fn hashed(nonce: Nonce) -> Self {
        Self {
            mode: NonceMode::Hashed,
            raw: Some(nonce),
            expected: nonce.hashed(),
        }
    }

    /// Only the hash is known; enough to validate but not to connect
    #[must_use]
    pub fn from_hash(hash: Nonce) -> Self {
        Self {
            mode: NonceMode::Hashed,
            raw: None,
            expected: hash,
        }
    }

    /// Comparison mode
    #[must_use]
    pub fn mode(&self) -> NonceMode {
        self.mode
    }

    /// Raw nonce, if known
    #[must_use]
    pub fn raw(&self) -> Option<Nonce> {
        self.raw
    }

    /// Value the fingerprint of a received nonce must equal
    #[must_use]
    pub fn expected(&self) -> Nonce {
        self.expected
    }

    /// Whether a received nonce proves knowledge of the shared secret
    #[must_use]
    pub fn matches(&self, received: &Nonce) -> bool {
        let fingerprint = match self.mode {
            NonceMode::Plain => *received,
            NonceMode::Hashed => received.hashed(),
        };
        fingerprint == self.expected
    }
}

/// Side of the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Accepted the socket
    Listener,
    /// Opened the socket
    Connector,
}

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not started or terminated
    Closed,
    /// Socket is being opened or awaited
    ListeningOrConnecting,
    /// Strict listener waiting for the greeting
    AwaitingPeerGreeting,
    /// Waiting for the peer's handshake frame
    AwaitingHandshake,
    /// Connector waiting for the listener's reply
    AwaitingHandshakeReply,
    /// Socket authenticated
    Established,
}

/// Something the socket owner must do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Write this frame body
    Send(Vec<u8>),
    /// The socket is authenticated
    Established,
    /// A valid handshake awaits [`DirectHandshake::accept`] or
    /// [`DirectHandshake::reject`]
    Surface(Nonce),
}

/// Handshake configuration
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Wire format of the handshake frame
    pub version: ProtocolVersion,
    /// Side of the socket
    pub role: HandshakeRole,
    /// Nonce knowledge
    pub auth: NonceAuth,
    /// Listener answers a valid handshake without asking the caller
    pub auto_handshake: bool,
    /// Listener insists on the greeting before the handshake
    pub require_greeting: bool,
}

impl HandshakeConfig {
    /// Listener configuration with automatic replies
    #[must_use]
    pub fn listener(version: ProtocolVersion, auth: NonceAuth) -> Self {
        Self {
            version,
            role: HandshakeRole::Listener,
            auth,
            auto_handshake: true,
            require_greeting: false,
        }
    }

    /// Connector configuration
    #[must_use]
    pub fn connector(version: ProtocolVersion, auth: NonceAuth) -> Self {
        Self {
            version,
            role: HandshakeRole::Connector,
            auth,
            auto_handshake: true,
            require_greeting: false,
        }
    }
}

/// Encode the handshake frame body carrying `nonce`.
///
/// V1 is a 48-octet header flagged `DIRECT_HANDSHAKE` with the nonce in the
/// acknowledgement fields (octets 32..48); V2 is the bare nonce.
#[must_use]
pub fn handshake_frame(version: ProtocolVersion, nonce: &Nonce) -> Vec<u8> {
    match version {
        ProtocolVersion::V1 => {
            let header = V1Header {
                flags: V1Flags::DIRECT_HANDSHAKE,
                ..V1Header::default()
            };
            let mut frame = header.to_bytes().to_vec();
            frame[32..V1_HEADER_SIZE].copy_from_slice(nonce.as_bytes());
            frame
        }
        ProtocolVersion::V2 => nonce.as_bytes().to_vec(),
    }
}

/// Extract the nonce from a handshake frame body.
///
/// # Errors
///
/// Returns [`HandshakeError::VersionMismatch`] if the frame has the other
/// version's length, [`HandshakeError::LengthMismatch`] for any other wrong
/// length and [`HandshakeError::NotAHandshake`] for a V1 header without the
/// handshake flag.
pub fn parse_handshake(version: ProtocolVersion, frame: &[u8]) -> Result<Nonce, HandshakeError> {
    let (expected, other) = match version {
        ProtocolVersion::V1 => (V1_HEADER_SIZE, NONCE_SIZE),
        ProtocolVersion::V2 => (NONCE_SIZE, V1_HEADER_SIZE),
    };
    if frame.len() != expected {
        if frame.len() == other {
            return Err(HandshakeError::VersionMismatch { expected: version });
        }
        return Err(HandshakeError::LengthMismatch {
            expected,
            actual: frame.len(),
        });
    }

    let nonce_bytes = match version {
        ProtocolVersion::V1 => {
            let (header, _) =
                V1Header::parse(frame).map_err(|_| HandshakeError::NotAHandshake)?;
            if !header.flags.contains(V1Flags::DIRECT_HANDSHAKE) {
                return Err(HandshakeError::NotAHandshake);
            }
            &frame[32..V1_HEADER_SIZE]
        }
        ProtocolVersion::V2 => frame,
    };

    let mut bytes = [0u8; NONCE_SIZE];
    bytes.copy_from_slice(nonce_bytes);
    Ok(Nonce(bytes))
}

/// Handshake state machine for one socket
#[derive(Debug)]
pub struct DirectHandshake {
    config: HandshakeConfig,
    state: HandshakeState,
    pending: Option<Vec<u8>>,
    peer_nonce: Option<Nonce>,
}

impl DirectHandshake {
    /// New handshake in [`HandshakeState::Closed`]
    #[must_use]
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            state: HandshakeState::Closed,
            pending: None,
            peer_nonce: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Side of the socket
    #[must_use]
    pub fn role(&self) -> HandshakeRole {
        self.config.role
    }

    /// Whether the socket is authenticated
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Nonce presented by the peer, once validated
    #[must_use]
    pub fn peer_nonce(&self) -> Option<Nonce> {
        self.peer_nonce
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(role = ?self.config.role, from = ?self.state, to = ?next, "handshake state");
        self.state = next;
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        warn!(role = ?self.config.role, state = ?self.state, error = %err, "handshake failed");
        self.pending = None;
        self.state = HandshakeState::Closed;
        err
    }

    /// Socket is being opened (connector) or awaited (listener)
    pub fn start(&mut self) {
        self.transition(HandshakeState::ListeningOrConnecting);
    }

    /// Listener accepted a socket
    pub fn on_accepted(&mut self) {
        let next = if self.config.require_greeting {
            HandshakeState::AwaitingPeerGreeting
        } else {
            HandshakeState::AwaitingHandshake
        };
        self.transition(next);
    }

    /// Connector's socket is open: send greeting and handshake.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::MissingNonce`] if only the nonce hash is known.
    pub fn on_connected(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let Some(nonce) = self.config.auth.raw() else {
            return Err(self.fail(HandshakeError::MissingNonce));
        };

        let mut actions = vec![HandshakeAction::Send(GREETING.to_vec())];
        self.transition(HandshakeState::AwaitingHandshake);
        actions.push(HandshakeAction::Send(handshake_frame(self.config.version, &nonce)));
        self.transition(HandshakeState::AwaitingHandshakeReply);
        Ok(actions)
    }

    /// Feed one frame body received from the peer.
    ///
    /// # Errors
    ///
    /// Any error terminates the handshake; the socket must be closed.
    pub fn on_frame(&mut self, frame: &[u8]) -> Result<Vec<HandshakeAction>, HandshakeError> {
        match self.state {
            HandshakeState::AwaitingPeerGreeting => {
                if frame != GREETING {
                    return Err(self.fail(HandshakeError::UnexpectedFrame(self.state)));
                }
                self.transition(HandshakeState::AwaitingHandshake);
                Ok(Vec::new())
            }
            HandshakeState::AwaitingHandshake if self.config.role == HandshakeRole::Listener => {
                if self.pending.is_some() {
                    return Err(self.fail(HandshakeError::UnexpectedFrame(self.state)));
                }
                if frame == GREETING {
                    return Ok(Vec::new());
                }
                let nonce = self.validate(frame)?;
                if self.config.auto_handshake {
                    self.establish(nonce);
                    Ok(vec![
                        HandshakeAction::Send(frame.to_vec()),
                        HandshakeAction::Established,
                    ])
                } else {
                    self.pending = Some(frame.to_vec());
                    self.peer_nonce = Some(nonce);
                    Ok(vec![HandshakeAction::Surface(nonce)])
                }
            }
            HandshakeState::AwaitingHandshakeReply => {
                let nonce = self.validate(frame)?;
                self.establish(nonce);
                Ok(vec![HandshakeAction::Established])
            }
            state => Err(self.fail(HandshakeError::UnexpectedFrame(state))),
        }
    }

    /// Answer a surfaced handshake.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::NothingPending`] if no handshake was surfaced.
    pub fn accept(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let Some(frame) = self.pending.take() else {
            return Err(HandshakeError::NothingPending);
        };
        let nonce = self.peer_nonce.unwrap_or_default();
        self.establish(nonce);
        Ok(vec![HandshakeAction::Send(frame), HandshakeAction::Established])
    }

    /// Refuse a surfaced handshake; the socket must be closed
    pub fn reject(&mut self) {
        self.pending = None;
        self.peer_nonce = None;
        self.transition(HandshakeState::Closed);
    }

    fn validate(&mut self, frame: &[u8]) -> Result<Nonce, HandshakeError> {
        let nonce = match parse_handshake(self.config.version, frame) {
            Ok(nonce) => nonce,
            Err(err) => return Err(self.fail(err)),
        };
        if !self.config.auth.matches(&nonce) {
            return Err(self.fail(HandshakeError::NonceMismatch));
        }
        Ok(nonce)
    }

    fn establish(&mut self, nonce: Nonce) {
        self.peer_nonce = Some(nonce);
        self.transition(HandshakeState::Established);
        info!(role = ?self.config.role, "direct connection established");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce() -> Nonce {
        Nonce::from_bytes([
            0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ])
    }

    fn run(
        version: ProtocolVersion,
        connector_auth: NonceAuth,
        listener_auth: NonceAuth,
    ) -> (DirectHandshake, DirectHandshake, Result<(), HandshakeError>) {
        let mut connector =
            DirectHandshake::new(HandshakeConfig::connector(version, connector_auth));
        let mut listener = DirectHandshake::new(HandshakeConfig::listener(version, listener_auth));
        connector.start();
        listener.start();
        listener.on_accepted();

        let result = (|| -> Result<(), HandshakeError> {
            for action in connector.on_connected()? {
                let HandshakeAction::Send(frame) = action else {
                    continue;
                };
                for reply in listener.on_frame(&frame)? {
                    if let HandshakeAction::Send(back) = reply {
                        connector.on_frame(&back)?;
                    }
                }
            }
            Ok(())
        })();
        (connector, listener, result)
    }

    #[test]
    fn test_plain_v1_establishes() {
        let (connector, listener, result) =
            run(ProtocolVersion::V1, NonceAuth::plain(nonce()), NonceAuth::plain(nonce()));
        result.unwrap();
        assert!(connector.is_established());
        assert!(listener.is_established());
        assert_eq!(listener.peer_nonce(), Some(nonce()));
    }

    #[test]
    fn test_hashed_v2_establishes_with_hash_only_listener() {
        let (connector, listener, result) = run(
            ProtocolVersion::V2,
            NonceAuth::hashed(nonce()),
            NonceAuth::from_hash(nonce().hashed()),
        );
        result.unwrap();
        assert!(connector.is_established());
        assert!(listener.is_established());
    }

    #[test]
    fn test_any_bit_flip_terminates() {
        for mode in [NonceMode::Plain, NonceMode::Hashed] {
            for bit in 0..128 {
                let mut bytes = *nonce().as_bytes();
                bytes[bit / 8] ^= 1 << (bit % 8);
                let mutated = Nonce::from_bytes(bytes);
                let (connector_auth, listener_auth) = match mode {
                    NonceMode::Plain => (NonceAuth::plain(mutated), NonceAuth::plain(nonce())),
                    NonceMode::Hashed => (NonceAuth::hashed(mutated), NonceAuth::hashed(nonce())),
                };
                let (connector, listener, result) =
                    run(ProtocolVersion::V1, connector_auth, listener_auth);
                assert_eq!(result, Err(HandshakeError::NonceMismatch));
                assert_eq!(listener.state(), HandshakeState::Closed);
                assert!(!connector.is_established());
            }
        }
    }

    #[test]
    fn test_v1_frame_layout() {
        let frame = handshake_frame(ProtocolVersion::V1, &nonce());
        assert_eq!(frame.len(), 48);
        assert_eq!(&frame[28..32], &0x100u32.to_le_bytes());
        assert_eq!(&frame[32..48], nonce().as_bytes());
        assert_eq!(parse_handshake(ProtocolVersion::V1, &frame), Ok(nonce()));
    }

    #[test]
    fn test_version_and_length_mismatch() {
        let v2 = handshake_frame(ProtocolVersion::V2, &nonce());
        assert_eq!(
            parse_handshake(ProtocolVersion::V1, &v2),
            Err(HandshakeError::VersionMismatch {
                expected: ProtocolVersion::V1
            })
        );
        assert_eq!(
            parse_handshake(ProtocolVersion::V2, &[0u8; 20]),
            Err(HandshakeError::LengthMismatch {
                expected: 16,
                actual: 20
            })
        );
        assert_eq!(
            parse_handshake(ProtocolVersion::V1, &[0u8; 48]),
            Err(HandshakeError::NotAHandshake)
        );
    }

    #[test]
    fn test_listener_skips_greeting() {
        let mut listener = DirectHandshake::new(HandshakeConfig::listener(
            ProtocolVersion::V2,
            NonceAuth::plain(nonce()),
        ));
        listener.start();
        listener.on_accepted();
        assert_eq!(listener.state(), HandshakeState::AwaitingHandshake);
        assert!(listener.on_frame(&GREETING).unwrap().is_empty());
        assert_eq!(listener.state(), HandshakeState::AwaitingHandshake);
    }

    #[test]
    fn test_strict_listener_requires_greeting() {
        let mut config = HandshakeConfig::listener(ProtocolVersion::V2, NonceAuth::plain(nonce()));
        config.require_greeting = true;
        let mut listener = DirectHandshake::new(config);
        listener.on_accepted();
        assert_eq!(listener.state(), HandshakeState::AwaitingPeerGreeting);

        let frame = handshake_frame(ProtocolVersion::V2, &nonce());
        assert_eq!(
            listener.on_frame(&frame),
            Err(HandshakeError::UnexpectedFrame(
                HandshakeState::AwaitingPeerGreeting
            ))
        );
        assert_eq!(listener.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_manual_accept() {
        let mut config = HandshakeConfig::listener(ProtocolVersion::V1, NonceAuth::plain(nonce()));
        config.auto_handshake = false;
        let mut listener = DirectHandshake::new(config);
        listener.on_accepted();

        let frame = handshake_frame(ProtocolVersion::V1, &nonce());
        assert_eq!(
            listener.on_frame(&frame).unwrap(),
            vec![HandshakeAction::Surface(nonce())]
        );
        assert!(!listener.is_established());
        assert_eq!(
            listener.accept().unwrap(),
            vec![HandshakeAction::Send(frame), HandshakeAction::Established]
        );
        assert!(listener.is_established());
        assert_eq!(listener.accept(), Err(HandshakeError::NothingPending));
    }

    #[test]
    fn test_manual_reject() {
        let mut config = HandshakeConfig::listener(ProtocolVersion::V1, NonceAuth::plain(nonce()));
        config.auto_handshake = false;
        let mut listener = DirectHandshake::new(config);
        listener.on_accepted();
        listener
            .on_frame(&handshake_frame(ProtocolVersion::V1, &nonce()))
            .unwrap();
        listener.reject();
        assert_eq!(listener.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_connector_needs_raw_nonce() {
        let mut connector = DirectHandshake::new(HandshakeConfig::connector(
            ProtocolVersion::V1,
            NonceAuth::from_hash(nonce()),
        ));
        assert_eq!(connector.on_connected(), Err(HandshakeError::MissingNonce));
    }

    #[test]
    fn test_nonce_text_forms() {
        let text = nonce().to_string();
        assert_eq!(text, "1032547698badcfe0123456789abcdef");
        assert_eq!(text.parse::<Nonce>().unwrap(), nonce());
        let guid = "{10325476-98ba-dcfe-0123-456789abcdef}";
        assert_eq!(guid.parse::<Nonce>().unwrap(), nonce());
        assert!("abc".parse::<Nonce>().is_err());
    }
}
