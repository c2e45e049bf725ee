//! Type-length-value regions used by the V2 header.
//!
//! Each entry is one type octet, one length octet and `length` value octets.
//! A region is zero-padded to a 4-octet boundary; a type octet of `0x00`
//! marks the start of padding. Entries keep their insertion order and unknown
//! types are carried through untouched so peers' extensions survive a
//! parse/serialize cycle.

use crate::error::HeaderError;

/// Largest TLV region that still fits a one-octet V2 header length (255 - 8,
/// rounded down to the 4-octet alignment).
pub const MAX_REGION_LEN: usize = 244;

/// A single TLV entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tlv {
    /// Type octet (never `0x00`)
    pub kind: u8,
    /// Value octets
    pub value: Vec<u8>,
}

impl Tlv {
    /// Encoded length of this entry including type and length octets
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        2 + self.value.len()
    }
}

/// Ordered list of TLV entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlvList {
    entries: Vec<Tlv>,
}

impl TlvList {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in wire order
    pub fn iter(&self) -> impl Iterator<Item = &Tlv> {
        self.entries.iter()
    }

    /// Value of the first entry with the given type
    #[must_use]
    pub fn get(&self, kind: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|tlv| tlv.kind == kind)
            .map(|tlv| tlv.value.as_slice())
    }

    /// Whether an entry with the given type is present
    #[must_use]
    pub fn contains(&self, kind: u8) -> bool {
        self.entries.iter().any(|tlv| tlv.kind == kind)
    }

    /// Insert or replace an entry, keeping the position of an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::ReservedTlvType`] for type `0x00` and
    /// [`HeaderError::TlvValueTooLong`] if the value exceeds 255 octets.
    pub fn set(&mut self, kind: u8, value: Vec<u8>) -> Result<(), HeaderError> {
        if kind == 0 {
            return Err(HeaderError::ReservedTlvType);
        }
        if value.len() > usize::from(u8::MAX) {
            return Err(HeaderError::TlvValueTooLong(value.len()));
        }

        match self.entries.iter_mut().find(|tlv| tlv.kind == kind) {
            Some(existing) => existing.value = value,
            None => self.entries.push(Tlv { kind, value }),
        }
        Ok(())
    }

    /// Remove the entry with the given type, returning its value
    pub fn remove(&mut self, kind: u8) -> Option<Vec<u8>> {
        let index = self.entries.iter().position(|tlv| tlv.kind == kind)?;
        Some(self.entries.remove(index).value)
    }

    /// Remove all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Read a big-endian `u32` value
    #[must_use]
    pub fn get_u32(&self, kind: u8) -> Option<u32> {
        let value = self.get(kind)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Read a big-endian `u64` value
    #[must_use]
    pub fn get_u64(&self, kind: u8) -> Option<u64> {
        let value = self.get(kind)?;
        let bytes: [u8; 8] = value.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Sum of the encoded entry lengths, without padding
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.entries.iter().map(Tlv::encoded_len).sum()
    }

    /// Encoded length rounded up to the 4-octet boundary
    #[must_use]
    pub fn padded_len(&self) -> usize {
        self.encoded_len().div_ceil(4) * 4
    }

    /// Append the entries plus zero padding to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TlvRegionTooLarge`] if the padded region would
    /// not fit a one-octet length field.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), HeaderError> {
        let padded = self.padded_len();
        if padded > MAX_REGION_LEN {
            return Err(HeaderError::TlvRegionTooLarge(padded));
        }

        for tlv in &self.entries {
            buf.push(tlv.kind);
            // set() bounds value length to u8::MAX
            buf.push(tlv.value.len() as u8);
            buf.extend_from_slice(&tlv.value);
        }
        buf.resize(buf.len() + padded - self.encoded_len(), 0);
        Ok(())
    }

    /// Parse a region; parsing stops at the first padding octet.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TlvOverflow`] if an entry runs past the region.
    pub fn parse(region: &[u8]) -> Result<Self, HeaderError> {
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < region.len() {
            let kind = region[offset];
            if kind == 0 {
                break;
            }
            if offset + 2 > region.len() {
                return Err(HeaderError::TlvOverflow { offset });
            }
            let len = usize::from(region[offset + 1]);
            let start = offset + 2;
            let end = start + len;
            if end > region.len() {
                return Err(HeaderError::TlvOverflow { offset });
            }
            entries.push(Tlv {
                kind,
                value: region[start..end].to_vec(),
            });
            offset = end;
        }

        Ok(Self { entries })
    }
}
