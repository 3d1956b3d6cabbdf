//! Initial sequence number generation.
//!
//! The registry owns one generator and hands ISNs to connections as they
//! open. A seedable linear congruential generator keeps tests fully
//! deterministic; the teaching tool keeps ISNs under one million so the
//! numbers stay readable on screen.

/// Upper bound (exclusive) for generated ISNs.
const ISN_RANGE: u64 = 1_000_000;

/// Seedable pseudo-random source for initial sequence numbers.
#[derive(Debug, Clone)]
pub struct IsnGenerator {
    state: u64,
}

impl IsnGenerator {
    /// Deterministic generator for a given seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            // Avoid the all-zero fixed point.
            state: seed ^ 0x9e37_79b9_7f4a_7c15,
        }
    }

    /// Generator seeded from the wall clock. Only the seed touches real
    /// time; everything downstream is deterministic from it.
    pub fn from_entropy() -> Self {
        use std::time::SystemTime;
        let seed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::from_seed(seed)
    }

    /// Next initial sequence number.
    pub fn next_isn(&mut self) -> u32 {
        // Knuth's MMIX LCG constants.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.state >> 33) % ISN_RANGE) as u32
    }
}
