//! Session-scoped random id source.
//!
//! Sequence bases, ack references and transfer session ids are drawn from a
//! per-session generator so tests can seed it for reproducible wire output.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::ops::RangeInclusive;

/// Range transfer session ids and sequence bases are drawn from
pub const ID_RANGE: RangeInclusive<u32> = 50_000..=(i32::MAX as u32);

/// Seedable random id generator
#[derive(Debug, Clone)]
pub struct IdGenerator {
    rng: StdRng,
}

impl IdGenerator {
    /// Generator seeded from the operating system
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic generator
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generator seeded when `seed` is set, from entropy otherwise
    #[must_use]
    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::new, Self::with_seed)
    }

    /// Id in [`ID_RANGE`], used for sequence bases and transfer sessions
    pub fn next_id(&mut self) -> u32 {
        self.rng.gen_range(ID_RANGE)
    }

    /// Non-zero random value, used for V1 ack references
    pub fn next_nonzero(&mut self) -> u32 {
        loop {
            let value = self.rng.next_u32();
            if value != 0 {
                return value;
            }
        }
    }

    /// Fill `dest` with random octets
    pub fn fill(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_is_deterministic() {
        let mut a = IdGenerator::with_seed(7);
        let mut b = IdGenerator::with_seed(7);
        for _ in 0..16 {
            assert_eq!(a.next_id(), b.next_id());
            assert_eq!(a.next_nonzero(), b.next_nonzero());
        }
    }

    #[test]
    fn test_ids_in_range() {
        let mut ids = IdGenerator::with_seed(1);
        for _ in 0..1000 {
            let id = ids.next_id();
            assert!(ID_RANGE.contains(&id));
            assert_ne!(ids.next_nonzero(), 0);
        }
    }
}
