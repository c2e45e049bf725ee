//! Reassembly of fragmented control messages.
//!
//! Only control-plane envelopes (session id 0) that arrive in several pieces
//! are buffered here. Data-plane envelopes, acknowledgements and single-shot
//! messages pass straight through. Any inconsistent fragment drops the
//! partial entry and is itself discarded; nothing here is fatal.

use crate::envelope::Envelope;
use crate::header::{Header, P2PHeader};
use crate::header::v1::V1Header;
use crate::header::v2::{TfCombination, V2Header};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Result of offering an envelope to the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// A complete message: either passed through or fully reassembled
    Complete(Envelope),
    /// Fragment stored; more are expected
    Buffered,
    /// Fragment was inconsistent and has been dropped
    Discarded,
}

struct V1Entry {
    header: V1Header,
    buffer: Vec<u8>,
    next_offset: u64,
}

struct V2Entry {
    header: V2Header,
    buffer: Vec<u8>,
    remaining: u64,
}

/// Pool of partially received control messages
pub struct ReassemblyPool {
    v1: HashMap<u32, V1Entry>,
    v2: HashMap<(u32, u16), V2Entry>,
    max_message_size: usize,
}

impl ReassemblyPool {
    /// Create a pool refusing messages larger than `max_message_size` octets
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            v1: HashMap::new(),
            v2: HashMap::new(),
            max_message_size,
        }
    }

    /// Number of partially assembled messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.v1.len() + self.v2.len()
    }

    /// Whether no message is partially assembled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every partial message
    pub fn clear(&mut self) {
        self.v1.clear();
        self.v2.clear();
    }

    /// Offer an envelope to the pool
    pub fn push(&mut self, envelope: Envelope) -> Reassembly {
        match envelope.header() {
            Header::V1(h) => {
                if h.session_id != 0 || h.is_acknowledgement() || h.is_single_chunk() {
                    return Reassembly::Complete(envelope);
                }
                let header = h.clone();
                self.push_v1(header, envelope)
            }
            Header::V2(h) => {
                let Some(dh) = &h.data_header else {
                    return Reassembly::Complete(envelope);
                };
                if dh.session_id != 0 {
                    return Reassembly::Complete(envelope);
                }
                let first = dh.tf_combination.contains(TfCombination::FIRST);
                if first && dh.data_remaining() == 0 {
                    return Reassembly::Complete(envelope);
                }
                let header = h.clone();
                if first {
                    self.start_v2(header, envelope)
                } else {
                    self.continue_v2(header, envelope)
                }
            }
        }
    }

    fn push_v1(&mut self, header: V1Header, envelope: Envelope) -> Reassembly {
        let key = header.identifier;
        let len = envelope.payload().len() as u64;
        let total = header.total_size;

        if header.offset == 0 {
            if total > self.max_message_size as u64 || len > total {
                warn!(identifier = key, total, "discarding oversized control message");
                self.v1.remove(&key);
                return Reassembly::Discarded;
            }
            let mut buffer = vec![0u8; total as usize];
            buffer[..len as usize].copy_from_slice(envelope.payload());
            trace!(identifier = key, total, "started reassembly");
            self.v1.insert(
                key,
                V1Entry {
                    header,
                    buffer,
                    next_offset: len,
                },
            );
            return Reassembly::Buffered;
        }

        let Some(entry) = self.v1.get_mut(&key) else {
            warn!(identifier = key, offset = header.offset, "fragment for unknown message");
            return Reassembly::Discarded;
        };

        let end = match header.offset.checked_add(len) {
            Some(end)
                if header.offset == entry.next_offset
                    && total == entry.header.total_size
                    && end <= total =>
            {
                end
            }
            _ => {
                warn!(
                    identifier = key,
                    offset = header.offset,
                    expected = entry.next_offset,
                    "out-of-order fragment, dropping message"
                );
                self.v1.remove(&key);
                return Reassembly::Discarded;
            }
        };

        entry.buffer[header.offset as usize..end as usize].copy_from_slice(envelope.payload());
        entry.next_offset = end;

        if end < total {
            return Reassembly::Buffered;
        }

        let Some(mut entry) = self.v1.remove(&key) else {
            return Reassembly::Discarded;
        };
        // the sender tracks the final fragment's ack reference
        entry.header.ack_session_id = header.ack_session_id;
        let mut complete = Envelope::from_parts(Header::V1(entry.header), entry.buffer);
        complete.set_footer(envelope.footer());
        trace!(identifier = key, total, "reassembled control message");
        Reassembly::Complete(complete)
    }

    fn start_v2(&mut self, header: V2Header, envelope: Envelope) -> Reassembly {
        let remaining = header.data_remaining();
        let size = match (envelope.payload().len() as u64).checked_add(remaining) {
            Some(size) if size <= self.max_message_size as u64 => size,
            _ => {
                warn!(
                    identifier = header.identifier,
                    remaining,
                    "discarding oversized control message"
                );
                return Reassembly::Discarded;
            }
        };

        let key = (
            header.identifier.wrapping_add(header.wire_chunk_size()),
            header.package_number(),
        );
        let mut buffer = Vec::with_capacity(size as usize);
        buffer.extend_from_slice(envelope.payload());
        trace!(identifier = header.identifier, remaining, "started reassembly");
        self.v2.insert(
            key,
            V2Entry {
                header,
                buffer,
                remaining,
            },
        );
        Reassembly::Buffered
    }

    fn continue_v2(&mut self, header: V2Header, envelope: Envelope) -> Reassembly {
        let key = (header.identifier, header.package_number());
        let Some(mut entry) = self.v2.remove(&key) else {
            warn!(identifier = key.0, package = key.1, "fragment for unknown message");
            return Reassembly::Discarded;
        };

        let len = envelope.payload().len() as u64;
        let remaining = header.data_remaining();
        if len.checked_add(remaining) != Some(entry.remaining) {
            warn!(
                identifier = key.0,
                expected = entry.remaining,
                remaining,
                "inconsistent fragment, dropping message"
            );
            return Reassembly::Discarded;
        }

        entry.buffer.extend_from_slice(envelope.payload());
        entry.remaining = remaining;

        if remaining > 0 {
            let next = (
                header.identifier.wrapping_add(header.wire_chunk_size()),
                header.package_number(),
            );
            self.v2.insert(next, entry);
            return Reassembly::Buffered;
        }

        let mut first = entry.header;
        first.data_header_mut().set_data_remaining(0);
        let mut complete = Envelope::from_parts(Header::V2(first), entry.buffer);
        complete.set_footer(envelope.footer());
        trace!(identifier = key.0, "reassembled control message");
        Reassembly::Complete(complete)
    }
}

impl Default for ReassemblyPool {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_CONTROL_MESSAGE)
    }
}

impl std::fmt::Debug for ReassemblyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReassemblyPool")
            .field("pending", &self.len())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
