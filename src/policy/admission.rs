//! TinyLFU admission filter.
//!
//! Decides, at the window→main boundary, whether an eviction candidate from
//! the window deserves a slot more than the main region's victim. The filter
//! keeps no per-entry state; popularity comes from the shared
//! [`FrequencySketch`].
//!
//! ## Decision Rule
//!
//! ```text
//!   admit(candidate, victim):
//!     c = frequency(candidate)      v = frequency(victim)
//!
//!     c > v            → admit  (candidate is simply hotter)
//!     c < 6            → reject (too cold to displace anything; also
//!                                starves hash-flooding attacks, which would
//!                                otherwise warm an arbitrary victim's slot)
//!     otherwise        → admit with probability 1/128, so near-ties cannot
//!                        permanently starve the window
//! ```
//!
//! The filter also lazily sizes the sketch: until the cache is half full
//! there is nothing worth protecting, so reads skip the buffers entirely and
//! the sketch table is not allocated (`is_warm` gates that fast path).

use crate::ds::sketch::FrequencySketch;

/// Candidates with an estimated frequency below this never win a tie.
const ADMIT_HASHDOS_THRESHOLD: u8 = 6;

/// Frequency-based admission policy over a Count-Min sketch.
#[derive(Debug, Default)]
pub struct TinyLfu {
    sketch: FrequencySketch,
}

impl TinyLfu {
    /// Creates a filter with an unsized sketch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the sketch has been sized and admission is
    /// meaningful.
    #[inline]
    pub fn is_warm(&self) -> bool {
        self.sketch.is_initialized()
    }

    /// Sizes the sketch for the given maximum weighted size.
    pub fn ensure_capacity(&mut self, maximum: u64) {
        self.sketch.ensure_capacity(maximum);
    }

    /// Records one access to `key_hash`.
    pub fn record(&mut self, key_hash: u64) {
        self.sketch.increment(key_hash);
    }

    /// Returns the estimated access frequency of `key_hash`.
    pub fn frequency(&self, key_hash: u64) -> u8 {
        self.sketch.frequency(key_hash)
    }

    /// Decides whether the window candidate should displace the main victim.
    pub fn admit(&self, candidate_hash: u64, victim_hash: u64) -> bool {
        let victim_freq = self.sketch.frequency(victim_hash);
        let candidate_freq = self.sketch.frequency(candidate_hash);
        if candidate_freq > victim_freq {
            return true;
        }
        if candidate_freq < ADMIT_HASHDOS_THRESHOLD {
            return false;
        }
        (rand::random::<u32>() & 127) == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
