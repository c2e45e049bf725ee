//! Header codec for the two P2P wire formats.
//!
//! A session negotiates one [`ProtocolVersion`] and every envelope it carries
//! uses the matching [`Header`] variant. Shared behaviour is exposed through
//! the [`P2PHeader`] trait so callers rarely need to match on the variant.

pub mod tlv;
pub mod v1;
pub mod v2;

use crate::error::HeaderError;
pub use tlv::{Tlv, TlvList};
use v1::V1Header;
use v2::V2Header;

/// Negotiated P2P protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// Fixed 48-octet little-endian header
    #[default]
    V1,
    /// Variable-length big-endian header with TLVs
    V2,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "P2P v1"),
            Self::V2 => write!(f, "P2P v2"),
        }
    }
}

/// Accessors shared by both header variants
pub trait P2PHeader {
    /// Wire format of this header
    fn version(&self) -> ProtocolVersion;

    /// Session id (0 = signaling)
    fn session_id(&self) -> u32;

    /// Set the session id
    fn set_session_id(&mut self, session_id: u32);

    /// Sequence identifier
    fn identifier(&self) -> u32;

    /// Set the sequence identifier
    fn set_identifier(&mut self, identifier: u32);

    /// Payload octets described by this header
    fn payload_len(&self) -> u32;

    /// Record the payload length, updating dependent size fields
    fn set_payload_len(&mut self, len: u32);

    /// Encoded header length in octets
    fn header_len(&self) -> usize;

    /// Whether this header acknowledges an earlier message
    fn is_acknowledgement(&self) -> bool;

    /// Amount the sequence identifier advances by for this message
    fn wire_chunk_size(&self) -> u32;
}

/// Header of either wire format
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Header {
    /// V1 header
    V1(V1Header),
    /// V2 header
    V2(V2Header),
}

impl Header {
    /// Empty header for the given version
    #[must_use]
    pub fn new(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V1 => Self::V1(V1Header::default()),
            ProtocolVersion::V2 => Self::V2(V2Header::default()),
        }
    }

    /// Parse a header of the given version, returning the octets consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] if `bytes` does not hold a well-formed header.
    pub fn parse(version: ProtocolVersion, bytes: &[u8]) -> Result<(Self, usize), HeaderError> {
        match version {
            ProtocolVersion::V1 => V1Header::parse(bytes).map(|(h, n)| (Self::V1(h), n)),
            ProtocolVersion::V2 => V2Header::parse(bytes).map(|(h, n)| (Self::V2(h), n)),
        }
    }

    /// Append the encoding to `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] if a V2 size field or TLV region overflows.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), HeaderError> {
        match self {
            Self::V1(h) => {
                h.write(buf);
                Ok(())
            }
            Self::V2(h) => h.write(buf),
        }
    }

    /// Encode into a new buffer.
    ///
    /// # Errors
    ///
    /// See [`Header::write`].
    pub fn serialize(&self) -> Result<Vec<u8>, HeaderError> {
        let mut buf = Vec::with_capacity(self.header_len());
        self.write(&mut buf)?;
        Ok(buf)
    }

    /// V1 view, if this is a V1 header
    #[must_use]
    pub fn as_v1(&self) -> Option<&V1Header> {
        match self {
            Self::V1(h) => Some(h),
            Self::V2(_) => None,
        }
    }

    /// Mutable V1 view
    pub fn as_v1_mut(&mut self) -> Option<&mut V1Header> {
        match self {
            Self::V1(h) => Some(h),
            Self::V2(_) => None,
        }
    }

    /// V2 view, if this is a V2 header
    #[must_use]
    pub fn as_v2(&self) -> Option<&V2Header> {
        match self {
            Self::V2(h) => Some(h),
            Self::V1(_) => None,
        }
    }

    /// Mutable V2 view
    pub fn as_v2_mut(&mut self) -> Option<&mut V2Header> {
        match self {
            Self::V2(h) => Some(h),
            Self::V1(_) => None,
        }
    }
}

impl From<V1Header> for Header {
    fn from(header: V1Header) -> Self {
        Self::V1(header)
    }
}

impl From<V2Header> for Header {
    fn from(header: V2Header) -> Self {
        Self::V2(header)
    }
}

impl P2PHeader for Header {
    fn version(&self) -> ProtocolVersion {
        match self {
            Self::V1(_) => ProtocolVersion::V1,
            Self::V2(_) => ProtocolVersion::V2,
        }
    }

    fn session_id(&self) -> u32 {
        match self {
            Self::V1(h) => h.session_id,
            Self::V2(h) => h.session_id(),
        }
    }

    fn set_session_id(&mut self, session_id: u32) {
        match self {
            Self::V1(h) => h.session_id = session_id,
            Self::V2(h) => h.set_session_id(session_id),
        }
    }

    fn identifier(&self) -> u32 {
        match self {
            Self::V1(h) => h.identifier,
            Self::V2(h) => h.identifier,
        }
    }

    fn set_identifier(&mut self, identifier: u32) {
        match self {
            Self::V1(h) => h.identifier = identifier,
            Self::V2(h) => h.identifier = identifier,
        }
    }

    fn payload_len(&self) -> u32 {
        match self {
            Self::V1(h) => h.message_size,
            Self::V2(h) => h.payload_len(),
        }
    }

    fn set_payload_len(&mut self, len: u32) {
        match self {
            Self::V1(h) => h.set_payload_len(len),
            Self::V2(h) => h.set_payload_len(len),
        }
    }

    fn header_len(&self) -> usize {
        match self {
            Self::V1(_) => crate::V1_HEADER_SIZE,
            Self::V2(h) => h.header_len(),
        }
    }

    fn is_acknowledgement(&self) -> bool {
        match self {
            Self::V1(h) => h.is_acknowledgement(),
            Self::V2(h) => h.is_acknowledgement(),
        }
    }

    fn wire_chunk_size(&self) -> u32 {
        match self {
            Self::V1(h) => h.message_size,
            Self::V2(h) => h.wire_chunk_size(),
        }
    }
}
