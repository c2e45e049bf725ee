//! Local and remote sequence counters.
//!
//! V1 identifiers count messages: each new message takes `current + 1`.
//! V2 identifiers count octets: a message takes `current` and advances the
//! counter by its chunk size. Local identifiers never take the base value.

use crate::header::{Header, P2PHeader};

/// Identifiers produced by this side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSequence {
    base: u32,
    current: u32,
}

impl LocalSequence {
    /// Counter starting at `base`
    #[must_use]
    pub fn new(base: u32) -> Self {
        Self {
            base,
            current: base,
        }
    }

    /// Base value
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Last value produced (V1) or next value to produce (V2)
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Next V1 identifier
    pub fn next_v1(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        if self.current == self.base {
            self.current = self.current.wrapping_add(1);
        }
        self.current
    }

    /// Next V2 identifier for a message of `chunk_size` wire octets
    pub fn next_v2(&mut self, chunk_size: u32) -> u32 {
        let mut id = self.current;
        if id == self.base {
            id = id.wrapping_add(1);
        }
        self.current = id.wrapping_add(chunk_size);
        id
    }

    /// Move the V2 counter back so `current` is handed out again; used when
    /// queued envelopes are renumbered
    pub fn rewind(&mut self, current: u32) {
        self.current = current;
    }
}

/// Identifiers observed from the peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteSequence {
    base: Option<u32>,
    current: u32,
}

impl RemoteSequence {
    /// First identifier seen from the peer
    #[must_use]
    pub fn base(&self) -> Option<u32> {
        self.base
    }

    /// Last identifier seen (V1) or the identifier expected next (V2)
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Record an inbound header
    pub fn observe(&mut self, header: &Header) {
        let identifier = header.identifier();
        if self.base.is_none() {
            self.base = Some(identifier);
        }
        self.current = match header {
            Header::V1(_) => identifier,
            Header::V2(h) => identifier.wrapping_add(h.wire_chunk_size()),
        };
    }
}
