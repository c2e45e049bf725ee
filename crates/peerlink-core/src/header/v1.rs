//! V1 binary header: fixed 48 octets, all integers little-endian.
//!
//! ```text
//!  0               4               8                              16
//! ┌───────────────┬───────────────┬───────────────────────────────┐
//! │  session id   │  identifier   │            offset             │
//! ├───────────────┴───────────────┼───────────────┬───────────────┤
//! │          total size           │ message size  │     flags     │
//! ├───────────────┬───────────────┼───────────────┴───────────────┤
//! │ ack session   │ ack identifier│        ack total size         │
//! └───────────────┴───────────────┴───────────────────────────────┘
//! 32                                                             48
//! ```

use crate::V1_HEADER_SIZE;
use crate::error::HeaderError;

/// V1 flag bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct V1Flags(u32);

impl V1Flags {
    /// No special meaning
    pub const NORMAL: Self = Self(0x0000_0000);
    /// Negative acknowledgement
    pub const NEGATIVE_ACK: Self = Self(0x0000_0001);
    /// Acknowledgement
    pub const ACKNOWLEDGEMENT: Self = Self(0x0000_0002);
    /// Peer is waiting for a reply
    pub const WAITING: Self = Self(0x0000_0004);
    /// Transfer error
    pub const ERROR: Self = Self(0x0000_0008);
    /// File payload marker
    pub const FILE: Self = Self(0x0000_0010);
    /// Data payload marker
    pub const DATA: Self = Self(0x0000_0020);
    /// Close the data session
    pub const CLOSE_SESSION: Self = Self(0x0000_0040);
    /// Transport-layer error
    pub const TLP_ERROR: Self = Self(0x0000_0080);
    /// Direct-connection handshake frame
    pub const DIRECT_HANDSHAKE: Self = Self(0x0000_0100);
    /// Display picture / emoticon data
    pub const MSN_OBJECT_DATA: Self = Self(0x0100_0020);
    /// File transfer data
    pub const FILE_DATA: Self = Self(0x0100_0030);

    /// Construct from raw bits
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Whether this marks an error condition reported by the peer
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.intersects(Self(
            Self::NEGATIVE_ACK.0 | Self::ERROR.0 | Self::TLP_ERROR.0,
        ))
    }
}

impl std::ops::BitOr for V1Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// V1 header
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct V1Header {
    /// Session id (0 = signaling)
    pub session_id: u32,
    /// Sequence identifier
    pub identifier: u32,
    /// Byte offset of this chunk within the whole message
    pub offset: u64,
    /// Total size of the whole message
    pub total_size: u64,
    /// Payload size of this chunk
    pub message_size: u32,
    /// Flag bitset
    pub flags: V1Flags,
    /// Acknowledgement session reference
    pub ack_session_id: u32,
    /// Acknowledged identifier
    pub ack_identifier: u32,
    /// Acknowledged total size
    pub ack_total_size: u64,
}

impl V1Header {
    /// Parse a header from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TooShort`] if fewer than 48 octets are available.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), HeaderError> {
        if data.len() < V1_HEADER_SIZE {
            return Err(HeaderError::TooShort {
                expected: V1_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let u32_at = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let header = Self {
            session_id: u32_at(0),
            identifier: u32_at(4),
            offset: u64_at(8),
            total_size: u64_at(16),
            message_size: u32_at(24),
            flags: V1Flags(u32_at(28)),
            ack_session_id: u32_at(32),
            ack_identifier: u32_at(36),
            ack_total_size: u64_at(40),
        };

        Ok((header, V1_HEADER_SIZE))
    }

    /// Append the 48-octet encoding to `buf`
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.session_id.to_le_bytes());
        buf.extend_from_slice(&self.identifier.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.total_size.to_le_bytes());
        buf.extend_from_slice(&self.message_size.to_le_bytes());
        buf.extend_from_slice(&self.flags.0.to_le_bytes());
        buf.extend_from_slice(&self.ack_session_id.to_le_bytes());
        buf.extend_from_slice(&self.ack_identifier.to_le_bytes());
        buf.extend_from_slice(&self.ack_total_size.to_le_bytes());
    }

    /// Encode into a fixed array
    #[must_use]
    pub fn to_bytes(&self) -> [u8; V1_HEADER_SIZE] {
        let mut buf = Vec::with_capacity(V1_HEADER_SIZE);
        self.write(&mut buf);
        let mut out = [0u8; V1_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Acknowledgement is the flag plus a non-zero acknowledged identifier
    #[must_use]
    pub fn is_acknowledgement(&self) -> bool {
        self.ack_identifier != 0 && self.flags.contains(V1Flags::ACKNOWLEDGEMENT)
    }

    /// Whether this chunk carries the whole message
    #[must_use]
    pub fn is_single_chunk(&self) -> bool {
        u64::from(self.message_size) == self.total_size
    }

    /// Whether this chunk ends the message (or claims to run past it)
    #[must_use]
    pub fn is_final_chunk(&self) -> bool {
        self.offset.saturating_add(u64::from(self.message_size)) >= self.total_size
    }

    /// Record a new payload length, growing the total size to cover it
    pub fn set_payload_len(&mut self, len: u32) {
        self.message_size = len;
        let end = self.offset.saturating_add(u64::from(len));
        if self.total_size < end {
            self.total_size = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> V1Header {
        V1Header {
            session_id: 0x0102_0304,
            identifier: 0x1111_2222,
            offset: 1202,
            total_size: 5000,
            message_size: 1202,
            flags: V1Flags::FILE_DATA,
            ack_session_id: 0xAABB_CCDD,
            ack_identifier: 0,
            ack_total_size: 0,
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..16], &1202u64.to_le_bytes());
        assert_eq!(&bytes[28..32], &[0x30, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_roundtrip() {
        let header = sample();
        let bytes = header.to_bytes();
        let (parsed, consumed) = V1Header::parse(&bytes).unwrap();
        assert_eq!(consumed, 48);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(
            V1Header::parse(&[0u8; 47]),
            Err(HeaderError::TooShort {
                expected: 48,
                actual: 47
            })
        );
    }

    #[test]
    fn test_acknowledgement_requires_flag_and_identifier() {
        let mut header = V1Header::default();
        assert!(!header.is_acknowledgement());

        header.ack_identifier = 42;
        assert!(!header.is_acknowledgement());

        header.flags = V1Flags::ACKNOWLEDGEMENT;
        assert!(header.is_acknowledgement());

        header.ack_identifier = 0;
        assert!(!header.is_acknowledgement());
    }

    #[test]
    fn test_flags() {
        let mut flags = V1Flags::NORMAL;
        flags.insert(V1Flags::WAITING);
        assert!(flags.contains(V1Flags::WAITING));
        assert!(!flags.is_error());
        flags.insert(V1Flags::TLP_ERROR);
        assert!(flags.is_error());
        flags.remove(V1Flags::TLP_ERROR);
        assert!(!flags.is_error());
        assert!(V1Flags::FILE_DATA.contains(V1Flags::DATA));
    }

    #[test]
    fn test_set_payload_len_grows_total() {
        let mut header = V1Header::default();
        header.set_payload_len(100);
        assert_eq!(header.total_size, 100);

        let mut chunk = sample();
        chunk.set_payload_len(10);
        assert_eq!(chunk.message_size, 10);
        assert_eq!(chunk.total_size, 5000);
    }
}
