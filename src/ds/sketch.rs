//! 4-bit Count-Min frequency sketch with periodic aging.
//!
//! Estimates how often a key has been touched without storing per-key state.
//! The admission filter compares a window candidate's estimate against the
//! main victim's to decide who stays.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     FrequencySketch Layout                          │
//! │                                                                     │
//! │   4 rows × width counters, 4 bits each, 16 counters per u64 word    │
//! │                                                                     │
//! │   row 0:  [c c c c c c c c c c c c c c c c][c c … ]                 │
//! │   row 1:  [c c c c c c c c c c c c c c c c][c c … ]                 │
//! │   row 2:  …                                                         │
//! │   row 3:  …                                                         │
//! │                                                                     │
//! │   increment(h):  slotᵢ = xxhash(seedᵢ, h) & (width-1), i = 0..4     │
//! │                  each counter saturates at 15                       │
//! │   frequency(h):  min over the four counters                         │
//! │                                                                     │
//! │   aging: after sample_size increments every counter is halved,      │
//! │          so stale popularity decays instead of pinning entries      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The sketch starts unsized; [`FrequencySketch::ensure_capacity`] allocates
//! the counter table lazily once the cache is populated enough for admission
//! to matter. All mutation happens under the eviction lock, so the table is
//! plain memory with a single writer.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// A counter saturates here; 4 bits per counter.
const COUNTER_MAX: u64 = 15;

/// Rows in the sketch; each row uses an independently seeded hash.
const ROWS: usize = 4;

/// Mask clearing the high bit of every nibble after a right shift, so
/// halving one counter never borrows from its neighbour.
const RESET_MASK: u64 = 0x7777_7777_7777_7777;

/// Per-row hash seeds.
const SEEDS: [u64; ROWS] = [
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0xd6e8_feb8_6659_fd93,
];

/// 4-bit Count-Min sketch used for TinyLFU admission decisions.
#[derive(Debug, Default)]
pub struct FrequencySketch {
    /// Counters per row; zero until `ensure_capacity` is called.
    width: usize,
    /// Packed counter table, `ROWS * width / 16` words.
    table: Vec<u64>,
    /// Increments since the last aging pass.
    size: u64,
    /// Aging threshold: ten times the cache maximum.
    sample_size: u64,
}

impl FrequencySketch {
    /// Creates an unsized sketch. Queries return zero and increments are
    /// ignored until [`ensure_capacity`](Self::ensure_capacity) runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the counter table has been allocated.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.width != 0
    }

    /// Sizes the table for an expected `maximum` of weighted entries.
    ///
    /// The per-row width becomes the next power of two at or above
    /// `maximum` (floor 8); the aging sample becomes `10 × maximum`.
    /// Growing an existing table resets all counters. Shrink requests are
    /// ignored.
    pub fn ensure_capacity(&mut self, maximum: u64) {
        let requested = usize::try_from(maximum.min(u64::from(u32::MAX))).unwrap_or(usize::MAX);
        let width = requested.max(8).next_power_of_two();
        if self.width >= width {
            return;
        }
        self.width = width;
        self.table = vec![0u64; ROWS * width / 16];
        self.size = 0;
        self.sample_size = maximum.saturating_mul(10).max(10);
    }

    /// Increments the four counters for `key_hash`, saturating each at 15.
    ///
    /// Triggers an aging pass once `sample_size` increments accumulate.
    pub fn increment(&mut self, key_hash: u64) {
        if !self.is_initialized() {
            return;
        }

        let mut added = false;
        for row in 0..ROWS {
            let slot = self.slot(row, key_hash);
            let (word, shift) = self.locate(row, slot);
            let counter = (self.table[word] >> shift) & COUNTER_MAX;
            if counter < COUNTER_MAX {
                self.table[word] += 1 << shift;
                added = true;
            }
        }

        if added {
            self.size += 1;
            if self.size >= self.sample_size {
                self.reset();
            }
        }
    }

    /// Returns the estimated frequency of `key_hash`: the minimum of the four
    /// row counters, in `0..=15`.
    pub fn frequency(&self, key_hash: u64) -> u8 {
        if !self.is_initialized() {
            return 0;
        }

        let mut count = COUNTER_MAX;
        for row in 0..ROWS {
            let slot = self.slot(row, key_hash);
            let (word, shift) = self.locate(row, slot);
            count = count.min((self.table[word] >> shift) & COUNTER_MAX);
        }
        count as u8
    }

    /// Halves every counter, decaying stale popularity.
    fn reset(&mut self) {
        for word in &mut self.table {
            *word = (*word >> 1) & RESET_MASK;
        }
        self.size /= 2;
    }

    #[inline]
    fn slot(&self, row: usize, key_hash: u64) -> usize {
        let mut hasher = XxHash64::with_seed(SEEDS[row]);
        hasher.write_u64(key_hash);
        (hasher.finish() as usize) & (self.width - 1)
    }

    #[inline]
    fn locate(&self, row: usize, slot: usize) -> (usize, u32) {
        let word = row * (self.width / 16) + (slot >> 4);
        let shift = ((slot & 15) << 2) as u32;
        (word, shift)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
