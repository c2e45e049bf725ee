//! Message envelopes: header + payload + optional footer.
//!
//! An [`Envelope`] keeps the header's size fields in step with its payload,
//! parses a nested [`SignalingMessage`] on demand, and knows how to produce
//! its own acknowledgement and how to split itself into wire-sized pieces.

use crate::FOOTER_SIZE;
use crate::error::HeaderError;
use crate::header::v1::{V1Flags, V1Header};
use crate::header::v2::{OperationCode, PeerInfo, TfCombination, V2Header};
use crate::header::{Header, P2PHeader, ProtocolVersion};
use crate::ids::IdGenerator;
use crate::inner::SignalingMessage;
use crate::transport::TransportKind;
use std::sync::OnceLock;

/// Application id carried in the relay footer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AppId(pub u32);

impl AppId {
    /// Signaling / unspecified
    pub const NONE: Self = Self(0);
    /// File transfer
    pub const FILE_TRANSFER: Self = Self(2);
    /// Custom emoticon
    pub const CUSTOM_EMOTICON: Self = Self(11);
    /// Display picture
    pub const DISPLAY_PICTURE: Self = Self(12);
}

/// One framed protocol message
#[derive(Debug, Clone)]
pub struct Envelope {
    header: Header,
    payload: Vec<u8>,
    footer: AppId,
    inner: OnceLock<Option<SignalingMessage>>,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.payload == other.payload && self.footer == other.footer
    }
}

impl Eq for Envelope {}

impl Envelope {
    /// Empty envelope of the given version
    #[must_use]
    pub fn new(version: ProtocolVersion) -> Self {
        Self::from_parts(Header::new(version), Vec::new())
    }

    /// Envelope from a header and payload; the header's size fields are
    /// updated to describe `payload`
    #[must_use]
    pub fn from_parts(header: Header, payload: Vec<u8>) -> Self {
        let mut envelope = Self {
            header,
            payload: Vec::new(),
            footer: AppId::NONE,
            inner: OnceLock::new(),
        };
        envelope.set_payload(payload);
        envelope
    }

    /// Control envelope carrying a signaling message
    #[must_use]
    pub fn signaling(version: ProtocolVersion, message: &SignalingMessage) -> Self {
        let mut header = Header::new(version);
        if let Header::V2(h) = &mut header {
            h.operation_code = OperationCode::RAK;
            let dh = h.data_header_mut();
            dh.tf_combination = TfCombination::FIRST;
        }
        Self::from_parts(header, message.to_bytes())
    }

    /// Header
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Mutable header; size fields are rewritten by [`Envelope::set_payload`]
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Wire format
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.header.version()
    }

    /// Payload octets
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the envelope, returning its payload
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Replace the payload, recomputing size fields and dropping the cached
    /// inner message
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        self.header.set_payload_len(len);
        self.payload = payload;
        self.inner = OnceLock::new();
    }

    /// Footer application id
    #[must_use]
    pub fn footer(&self) -> AppId {
        self.footer
    }

    /// Set the footer application id
    pub fn set_footer(&mut self, footer: AppId) {
        self.footer = footer;
    }

    /// Session id
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.header.session_id()
    }

    /// Sequence identifier
    #[must_use]
    pub fn identifier(&self) -> u32 {
        self.header.identifier()
    }

    /// Whether this acknowledges an earlier message
    #[must_use]
    pub fn is_acknowledgement(&self) -> bool {
        self.header.is_acknowledgement()
    }

    /// Whether the peer reported an error (V1 error flags or V2 NAK)
    #[must_use]
    pub fn is_error(&self) -> bool {
        match &self.header {
            Header::V1(h) => h.flags.is_error(),
            Header::V2(h) => h.nak_identifier().is_some(),
        }
    }

    /// Nested signaling message, parsed on first access.
    ///
    /// Only control envelopes (session 0, not an acknowledgement, non-empty
    /// payload) carry one.
    pub fn inner_message(&self) -> Option<&SignalingMessage> {
        self.inner
            .get_or_init(|| {
                if self.session_id() != 0 || self.is_acknowledgement() || self.payload.is_empty() {
                    return None;
                }
                SignalingMessage::parse(&self.payload)
            })
            .as_ref()
    }

    /// Build the acknowledgement for this envelope.
    ///
    /// V1 rotates the sequence fields into the ack fields; V2 acknowledges
    /// `identifier + chunk size` and answers a SYN with SYN plus peer info.
    #[must_use]
    pub fn create_acknowledgement(&self) -> Self {
        let header = match &self.header {
            Header::V1(orig) => Header::V1(V1Header {
                session_id: orig.session_id,
                total_size: orig.total_size,
                flags: V1Flags::ACKNOWLEDGEMENT,
                ack_session_id: orig.identifier,
                ack_identifier: orig.ack_session_id,
                ack_total_size: orig.total_size,
                ..V1Header::default()
            }),
            Header::V2(orig) => {
                let mut ack = V2Header::new(OperationCode::NONE);
                ack.set_ack_identifier(orig.identifier.wrapping_add(orig.wire_chunk_size()));
                if orig.operation_code.contains(OperationCode::SYN) {
                    ack.operation_code = OperationCode::SYN;
                    ack.set_peer_info(PeerInfo::default());
                }
                Header::V2(ack)
            }
        };
        Self::from_parts(header, Vec::new())
    }

    /// Split into pieces whose payload is at most `max_payload` octets.
    ///
    /// A payload that already fits is returned as a single clone. V1 pieces
    /// share identifier and total size, advance the offset and get a fresh
    /// ack reference each. V2 pieces clear FIRST and SYN after the first,
    /// drop header TLVs after the first and carry their own bytes-remaining;
    /// a non-zero identifier is advanced by each piece's chunk size.
    #[must_use]
    pub fn split(&self, max_payload: usize, ids: &mut IdGenerator) -> Vec<Self> {
        let max_payload = max_payload.max(1);
        if self.payload.len() <= max_payload {
            return vec![self.clone()];
        }

        match &self.header {
            Header::V1(orig) => self
                .payload
                .chunks(max_payload)
                .enumerate()
                .map(|(i, chunk)| {
                    let mut header = orig.clone();
                    header.offset = orig.offset.saturating_add((i * max_payload) as u64);
                    header.ack_session_id = ids.next_nonzero();
                    let mut piece = Self::from_parts(Header::V1(header), chunk.to_vec());
                    piece.footer = self.footer;
                    piece
                })
                .collect(),
            Header::V2(orig) => {
                let base_remaining = orig.data_remaining();
                let total = self.payload.len();
                let mut next_id = orig.identifier;
                let mut pieces = Vec::with_capacity(total.div_ceil(max_payload));

                for (i, chunk) in self.payload.chunks(max_payload).enumerate() {
                    let end = (i * max_payload + chunk.len()) as u64;
                    let mut header = orig.clone();
                    if i > 0 {
                        header.operation_code.remove(OperationCode::SYN);
                        header.tlvs.clear();
                        header.data_header_mut().tf_combination.remove(TfCombination::FIRST);
                    }
                    header
                        .data_header_mut()
                        .set_data_remaining(base_remaining.saturating_add(total as u64 - end));
                    header.identifier = next_id;

                    let mut piece = Self::from_parts(Header::V2(header), chunk.to_vec());
                    piece.footer = self.footer;
                    if next_id != 0 {
                        next_id = next_id.wrapping_add(piece.header.wire_chunk_size());
                    }
                    pieces.push(piece);
                }
                pieces
            }
        }
    }

    /// Encode for the given transport; relay framing appends the footer.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] if the header cannot describe the payload.
    pub fn to_bytes(&self, kind: TransportKind) -> Result<Vec<u8>, HeaderError> {
        let footer_len = if kind.has_footer() { FOOTER_SIZE } else { 0 };
        let mut buf =
            Vec::with_capacity(self.header.header_len() + self.payload.len() + footer_len);
        self.header.write(&mut buf)?;
        buf.extend_from_slice(&self.payload);
        if kind.has_footer() {
            buf.extend_from_slice(&self.footer.0.to_be_bytes());
        }
        Ok(buf)
    }

    /// Decode a frame received on a transport of the given kind.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] if the header is malformed or the frame is
    /// shorter than the payload (and footer) it declares.
    pub fn parse(
        version: ProtocolVersion,
        data: &[u8],
        kind: TransportKind,
    ) -> Result<Self, HeaderError> {
        let (header, consumed) = Header::parse(version, data)?;
        let payload_len = header.payload_len() as usize;
        let footer_len = if kind.has_footer() { FOOTER_SIZE } else { 0 };
        let available = data.len() - consumed;
        if payload_len + footer_len > available {
            return Err(HeaderError::PayloadOverflow {
                declared: payload_len + footer_len,
                available,
            });
        }

        let payload = data[consumed..consumed + payload_len].to_vec();
        let footer = if kind.has_footer() {
            let at = consumed + payload_len;
            AppId(u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]))
        } else {
            AppId::NONE
        };

        Ok(Self {
            header,
            payload,
            footer,
            inner: OnceLock::new(),
        })
    }
}
