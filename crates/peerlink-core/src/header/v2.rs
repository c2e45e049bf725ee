//! V2 binary header: variable length, all integers big-endian.
//!
//! ```text
//! ┌────────┬─────────┬──────────────┬────────────────┬─────────────────┐
//! │ hdrlen │ op code │  chunk size  │   identifier   │ header TLVs ... │
//! │   u8   │   u8    │     u16      │      u32       │  (padded to 4)  │
//! └────────┴─────────┴──────────────┴────────────────┴─────────────────┘
//! followed, when chunk size > 0, by the data packet header:
//! ┌────────┬─────────┬──────────────┬────────────────┬─────────────────┐
//! │ dhlen  │   TF    │ package no.  │   session id   │  data TLVs ...  │
//! │   u8   │   u8    │     u16      │      u32       │  (padded to 4)  │
//! └────────┴─────────┴──────────────┴────────────────┴─────────────────┘
//! ```
//!
//! The chunk size counts the data packet header plus the payload, so the
//! payload length is `chunk size - dhlen`.

use super::tlv::TlvList;
use crate::V2_MIN_HEADER_SIZE;
use crate::error::HeaderError;

/// Header TLV: peer capability info
pub const PEER_INFO_TLV: u8 = 0x01;
/// Header TLV: acknowledged identifier
pub const ACK_TLV: u8 = 0x02;
/// Header TLV: negatively acknowledged identifier
pub const NAK_TLV: u8 = 0x03;
/// Data packet TLV: payload octets still to come after this chunk
pub const DATA_REMAINING_TLV: u8 = 0x01;

/// Size of the data packet header without TLVs
pub const DATA_HEADER_MIN_SIZE: usize = 8;

macro_rules! bitset_u8 {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$cmeta:meta])* $konst:ident = $value:expr),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(u8);

        impl $name {
            $($(#[$cmeta])* pub const $konst: Self = Self($value);)*

            /// Construct from raw bits
            #[must_use]
            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            /// Raw bits
            #[must_use]
            pub const fn bits(self) -> u8 {
                self.0
            }

            /// Whether every bit of `other` is set
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Set the bits of `other`
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clear the bits of `other`
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitset_u8! {
    /// V2 operation code bitset
    OperationCode {
        /// No operation
        NONE = 0x00,
        /// Connection setup, carries peer info
        SYN = 0x01,
        /// Request for acknowledgement
        RAK = 0x02,
    }
}

bitset_u8! {
    /// V2 fragmentation-combination flags of a data packet
    TfCombination {
        /// Continuation of a control message
        NONE = 0x00,
        /// First packet of a logical message
        FIRST = 0x01,
        /// Display picture / emoticon data
        MSN_OBJECT = 0x04,
        /// File transfer data
        FILE_TRANSFER = 0x06,
    }
}

/// Peer capability information carried in TLV 0x01 of SYN headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    /// P2P protocol version
    pub protocol_version: u16,
    /// Implementation identifier
    pub implementation_id: u16,
    /// Implementation version
    pub version: u16,
    /// Reserved, zero
    pub reserved: u16,
    /// Capability bitset
    pub capabilities: u32,
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self {
            protocol_version: 0x0200,
            implementation_id: 0,
            version: 0x0e00,
            reserved: 0,
            capabilities: 0x0000_010f,
        }
    }
}

impl PeerInfo {
    /// Encoded size in octets
    pub const SIZE: usize = 12;

    /// Encode as a TLV value
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.protocol_version.to_be_bytes());
        out[2..4].copy_from_slice(&self.implementation_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.reserved.to_be_bytes());
        out[8..12].copy_from_slice(&self.capabilities.to_be_bytes());
        out
    }

    /// Decode from a TLV value; `None` if the value is too short
    #[must_use]
    pub fn from_bytes(value: &[u8]) -> Option<Self> {
        if value.len() < Self::SIZE {
            return None;
        }
        let u16_at = |at: usize| u16::from_be_bytes([value[at], value[at + 1]]);
        Some(Self {
            protocol_version: u16_at(0),
            implementation_id: u16_at(2),
            version: u16_at(4),
            reserved: u16_at(6),
            capabilities: u32::from_be_bytes([value[8], value[9], value[10], value[11]]),
        })
    }
}

/// Data packet header that follows the V2 header when chunk size > 0
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DataPacketHeader {
    /// Fragmentation-combination flags
    pub tf_combination: TfCombination,
    /// Package number distinguishing logical messages
    pub package_number: u16,
    /// Session id (0 = signaling)
    pub session_id: u32,
    /// Data TLVs
    pub tlvs: TlvList,
}

impl DataPacketHeader {
    /// Encoded length including padded TLVs
    #[must_use]
    pub fn len(&self) -> usize {
        DATA_HEADER_MIN_SIZE + self.tlvs.padded_len()
    }

    /// Always false; a data packet header is never empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Payload octets still to come after this chunk
    #[must_use]
    pub fn data_remaining(&self) -> u64 {
        self.tlvs.get_u64(DATA_REMAINING_TLV).unwrap_or(0)
    }

    /// Set the bytes-remaining TLV; zero removes it
    pub fn set_data_remaining(&mut self, remaining: u64) {
        if remaining == 0 {
            self.tlvs.remove(DATA_REMAINING_TLV);
        } else {
            // 8-octet value on a non-zero type always fits
            let _ = self
                .tlvs
                .set(DATA_REMAINING_TLV, remaining.to_be_bytes().to_vec());
        }
    }

    fn parse(data: &[u8]) -> Result<(Self, usize), HeaderError> {
        if data.len() < DATA_HEADER_MIN_SIZE {
            return Err(HeaderError::TooShort {
                expected: DATA_HEADER_MIN_SIZE,
                actual: data.len(),
            });
        }
        let len = usize::from(data[0]);
        if len < DATA_HEADER_MIN_SIZE || len % 4 != 0 {
            return Err(HeaderError::InvalidHeaderLength(data[0]));
        }
        if data.len() < len {
            return Err(HeaderError::TooShort {
                expected: len,
                actual: data.len(),
            });
        }

        let header = Self {
            tf_combination: TfCombination(data[1]),
            package_number: u16::from_be_bytes([data[2], data[3]]),
            session_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            tlvs: TlvList::parse(&data[DATA_HEADER_MIN_SIZE..len])?,
        };
        Ok((header, len))
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<(), HeaderError> {
        let len = u8::try_from(self.len()).map_err(|_| HeaderError::TlvRegionTooLarge(self.len()))?;
        buf.push(len);
        buf.push(self.tf_combination.0);
        buf.extend_from_slice(&self.package_number.to_be_bytes());
        buf.extend_from_slice(&self.session_id.to_be_bytes());
        self.tlvs.write(buf)
    }
}

/// V2 header
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct V2Header {
    /// Operation code bitset
    pub operation_code: OperationCode,
    /// Sequence identifier
    pub identifier: u32,
    /// Header TLVs (peer info, ack, nak, unknown)
    pub tlvs: TlvList,
    /// Data packet header, present iff the chunk size is non-zero
    pub data_header: Option<DataPacketHeader>,
    payload_len: u32,
}

impl V2Header {
    /// Create a header with the given operation code
    #[must_use]
    pub fn new(operation_code: OperationCode) -> Self {
        Self {
            operation_code,
            ..Self::default()
        }
    }

    /// Encoded length of the fixed part plus header TLVs
    #[must_use]
    pub fn base_len(&self) -> usize {
        V2_MIN_HEADER_SIZE + self.tlvs.padded_len()
    }

    /// Encoded length including the data packet header
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.base_len() + self.data_header.as_ref().map_or(0, DataPacketHeader::len)
    }

    /// Chunk size as written on the wire: data header plus payload
    #[must_use]
    pub fn wire_chunk_size(&self) -> u32 {
        let data_header = self.data_header.as_ref().map_or(0, DataPacketHeader::len);
        self.payload_len.saturating_add(data_header as u32)
    }

    /// Payload length described by this header
    #[must_use]
    pub fn payload_len(&self) -> u32 {
        self.payload_len
    }

    /// Record a payload length; a non-empty payload implies a data header
    pub fn set_payload_len(&mut self, len: u32) {
        self.payload_len = len;
        if len > 0 && self.data_header.is_none() {
            self.data_header = Some(DataPacketHeader::default());
        }
    }

    /// Data packet header, created on first use
    pub fn data_header_mut(&mut self) -> &mut DataPacketHeader {
        self.data_header.get_or_insert_with(DataPacketHeader::default)
    }

    /// Session id from the data packet header, 0 if absent
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.data_header.as_ref().map_or(0, |dh| dh.session_id)
    }

    /// Set the session id; a zero id on a header without data header is a no-op
    pub fn set_session_id(&mut self, session_id: u32) {
        if session_id == 0 && self.data_header.is_none() {
            return;
        }
        self.data_header_mut().session_id = session_id;
    }

    /// Fragmentation flags, `NONE` if there is no data header
    #[must_use]
    pub fn tf_combination(&self) -> TfCombination {
        self.data_header
            .as_ref()
            .map_or(TfCombination::NONE, |dh| dh.tf_combination)
    }

    /// Package number, 0 if there is no data header
    #[must_use]
    pub fn package_number(&self) -> u16 {
        self.data_header.as_ref().map_or(0, |dh| dh.package_number)
    }

    /// Bytes remaining after this chunk, 0 if there is no data header
    #[must_use]
    pub fn data_remaining(&self) -> u64 {
        self.data_header
            .as_ref()
            .map_or(0, DataPacketHeader::data_remaining)
    }

    /// Acknowledged identifier (TLV 0x02)
    #[must_use]
    pub fn ack_identifier(&self) -> Option<u32> {
        self.tlvs.get_u32(ACK_TLV)
    }

    /// Set the acknowledged identifier
    pub fn set_ack_identifier(&mut self, identifier: u32) {
        let _ = self.tlvs.set(ACK_TLV, identifier.to_be_bytes().to_vec());
    }

    /// Negatively acknowledged identifier (TLV 0x03)
    #[must_use]
    pub fn nak_identifier(&self) -> Option<u32> {
        self.tlvs.get_u32(NAK_TLV)
    }

    /// Set the negatively acknowledged identifier
    pub fn set_nak_identifier(&mut self, identifier: u32) {
        let _ = self.tlvs.set(NAK_TLV, identifier.to_be_bytes().to_vec());
    }

    /// Peer info (TLV 0x01)
    #[must_use]
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.tlvs.get(PEER_INFO_TLV).and_then(PeerInfo::from_bytes)
    }

    /// Set the peer info TLV
    pub fn set_peer_info(&mut self, info: PeerInfo) {
        let _ = self.tlvs.set(PEER_INFO_TLV, info.to_bytes().to_vec());
    }

    /// Acknowledgement is the presence of the ack TLV
    #[must_use]
    pub fn is_acknowledgement(&self) -> bool {
        self.tlvs.contains(ACK_TLV)
    }

    /// Parse a header (and its data packet header) from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] if the lengths are inconsistent or a TLV
    /// region is malformed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), HeaderError> {
        if data.len() < V2_MIN_HEADER_SIZE {
            return Err(HeaderError::TooShort {
                expected: V2_MIN_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let header_len = usize::from(data[0]);
        if header_len < V2_MIN_HEADER_SIZE || header_len % 4 != 0 {
            return Err(HeaderError::InvalidHeaderLength(data[0]));
        }
        if data.len() < header_len {
            return Err(HeaderError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        let chunk = usize::from(u16::from_be_bytes([data[2], data[3]]));
        let mut header = Self {
            operation_code: OperationCode(data[1]),
            identifier: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            tlvs: TlvList::parse(&data[V2_MIN_HEADER_SIZE..header_len])?,
            data_header: None,
            payload_len: 0,
        };
        let mut consumed = header_len;

        if chunk > 0 {
            let (data_header, dh_len) = DataPacketHeader::parse(&data[consumed..])?;
            if chunk < dh_len {
                return Err(HeaderError::InvalidChunkSize {
                    chunk,
                    data_header: dh_len,
                });
            }
            header.payload_len = (chunk - dh_len) as u32;
            header.data_header = Some(data_header);
            consumed += dh_len;
        }

        Ok((header, consumed))
    }

    /// Append the encoding (including the data packet header) to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::PayloadTooLarge`] if the chunk size does not
    /// fit 16 bits, or a TLV error if a region is too large.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), HeaderError> {
        let chunk = match &self.data_header {
            Some(_) => self.wire_chunk_size(),
            None if self.payload_len > 0 => {
                return Err(HeaderError::InvalidChunkSize {
                    chunk: self.payload_len as usize,
                    data_header: 0,
                });
            }
            None => 0,
        };
        let chunk = u16::try_from(chunk)
            .map_err(|_| HeaderError::PayloadTooLarge(self.payload_len as usize))?;
        let base_len = u8::try_from(self.base_len())
            .map_err(|_| HeaderError::TlvRegionTooLarge(self.base_len()))?;

        buf.push(base_len);
        buf.push(self.operation_code.0);
        buf.extend_from_slice(&chunk.to_be_bytes());
        buf.extend_from_slice(&self.identifier.to_be_bytes());
        self.tlvs.write(buf)?;

        if let Some(data_header) = &self.data_header {
            data_header.write(buf)?;
        }
        Ok(())
    }
}
