//! Hierarchical timer wheel for variable per-entry expiration.
//!
//! Entries with a per-entry deadline are binned into power-of-two time spans.
//! Advancing the wheel sweeps every bucket the clock passed over: due entries
//! are surfaced for eviction, the rest cascade down into a finer level.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                       TimerWheel Levels                            │
//! │                                                                    │
//! │   level  buckets  span/bucket   covers                             │
//! │   ─────  ───────  ───────────   ──────────────                     │
//! │     0       64       ~1.07s     about a minute                     │
//! │     1       64       ~1.14m     about an hour                      │
//! │     2       32       ~1.22h     about a day                        │
//! │     3        4       ~1.63d     about a week                       │
//! │     4        1       ~6.5d      everything later                   │
//! │                                                                    │
//! │   schedule(deadline):  pick the finest level whose next span       │
//! │                        still contains the deadline, then           │
//! │                        bucket = (deadline >> shift) & (buckets-1)  │
//! │                                                                    │
//! │   advance(now):        sweep passed buckets per level; expired     │
//! │                        entries are returned, later ones cascade    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Buckets are [`OrderDeque`]s on the timer lane of the shared node arena,
//! so scheduling costs no allocation. Each entry remembers its (level,
//! bucket) coordinates, making deschedule O(1).
//!
//! ## Thread Safety
//!
//! None; the wheel is part of the policy state mutated only under the
//! eviction lock.

use crate::ds::deque::{Lane, NodeArena, OrderDeque, SlotId};

/// Buckets per level.
const BUCKETS: [usize; 5] = [64, 64, 32, 4, 1];

/// Bit shifts turning nanoseconds into level ticks. Each level's span is
/// `1 << SHIFT[i]` nanoseconds.
const SHIFT: [u32; 5] = [30, 36, 42, 47, 49];

const LEVELS: usize = 5;

/// Arena payloads the wheel can schedule.
pub trait TimerEntry {
    /// Absolute expiration deadline in ticker nanoseconds.
    fn deadline(&self) -> u64;

    /// Current wheel coordinates, if scheduled.
    fn timer_slot(&self) -> Option<(u8, u8)>;

    /// Records (or clears) the wheel coordinates.
    fn set_timer_slot(&mut self, slot: Option<(u8, u8)>);
}

/// Hierarchical timing wheel over the arena's timer lane.
#[derive(Debug)]
pub struct TimerWheel {
    /// The wheel's current time; advanced monotonically.
    nanos: u64,
    wheel: Vec<Vec<OrderDeque>>,
}

impl TimerWheel {
    /// Creates a wheel positioned at time zero.
    pub fn new() -> Self {
        let wheel = BUCKETS
            .iter()
            .map(|&len| (0..len).map(|_| OrderDeque::new(Lane::Timer)).collect())
            .collect();
        Self { nanos: 0, wheel }
    }

    /// Returns the wheel's current time.
    #[inline]
    pub fn nanos(&self) -> u64 {
        self.nanos
    }

    /// Schedules `id` according to its deadline.
    ///
    /// The entry must not already be scheduled.
    pub fn schedule<T: TimerEntry>(&mut self, arena: &mut NodeArena<T>, id: SlotId) {
        let deadline = match arena.get(id) {
            Some(entry) => entry.deadline(),
            None => return,
        };
        let (level, bucket) = self.locate(deadline);
        self.wheel[level][bucket].push_back(arena, id);
        if let Some(entry) = arena.get_mut(id) {
            entry.set_timer_slot(Some((level as u8, bucket as u8)));
        }
    }

    /// Removes `id` from the wheel, if scheduled.
    pub fn deschedule<T: TimerEntry>(&mut self, arena: &mut NodeArena<T>, id: SlotId) {
        let slot = arena.get(id).and_then(|entry| entry.timer_slot());
        if let Some((level, bucket)) = slot {
            self.wheel[level as usize][bucket as usize].unlink(arena, id);
            if let Some(entry) = arena.get_mut(id) {
                entry.set_timer_slot(None);
            }
        }
    }

    /// Moves `id` to the bucket matching its current deadline.
    pub fn reschedule<T: TimerEntry>(&mut self, arena: &mut NodeArena<T>, id: SlotId) {
        self.deschedule(arena, id);
        self.schedule(arena, id);
    }

    /// Advances the wheel to `now`, returning the entries whose deadline has
    /// passed. Entries the sweep uncovered that are not yet due cascade into
    /// a finer bucket instead.
    ///
    /// Returned entries are already unlinked from the wheel; the caller is
    /// expected to re-`schedule` any it declines to evict.
    pub fn advance<T: TimerEntry>(&mut self, arena: &mut NodeArena<T>, now: u64) -> Vec<SlotId> {
        let previous = self.nanos;
        if now <= previous {
            return Vec::new();
        }
        self.nanos = now;

        let mut expired = Vec::new();
        let mut pending = Vec::new();
        for level in 0..LEVELS {
            let previous_ticks = previous >> SHIFT[level];
            let current_ticks = now >> SHIFT[level];
            let delta = current_ticks - previous_ticks;
            if delta == 0 {
                break;
            }

            let mask = (BUCKETS[level] - 1) as u64;
            let steps = (delta + 1).min(BUCKETS[level] as u64);
            for step in 0..steps {
                let bucket = ((previous_ticks + step) & mask) as usize;
                // Take the whole bucket out before re-binning, so a cascade
                // into this same bucket is not swept twice.
                pending.clear();
                while let Some(id) = self.wheel[level][bucket].pop_front(arena) {
                    if let Some(entry) = arena.get_mut(id) {
                        entry.set_timer_slot(None);
                    }
                    pending.push(id);
                }
                for &id in &pending {
                    let deadline = arena.get(id).map(|e| e.deadline()).unwrap_or(0);
                    if deadline <= now {
                        expired.push(id);
                    } else {
                        self.schedule(arena, id);
                    }
                }
            }
        }
        expired
    }

    /// Returns the earliest scheduled deadline, if any.
    ///
    /// Within a level, buckets nearer the current tick hold earlier
    /// deadlines, so the first occupied bucket per level bounds that level's
    /// minimum; the result is exact enough for pacing the next cleanup.
    pub fn next_expiration<T: TimerEntry>(&self, arena: &NodeArena<T>) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        for level in 0..LEVELS {
            let ticks = self.nanos >> SHIFT[level];
            let mask = (BUCKETS[level] - 1) as u64;
            for step in 0..BUCKETS[level] as u64 {
                let bucket = ((ticks + step) & mask) as usize;
                let deque = &self.wheel[level][bucket];
                if deque.is_empty() {
                    continue;
                }
                if let Some(min) = deque.iter(arena).map(|(_, e)| e.deadline()).min() {
                    let min = min.max(self.nanos);
                    earliest = Some(earliest.map_or(min, |e| e.min(min)));
                }
                break;
            }
        }
        earliest
    }

    /// Unlinks every scheduled entry without expiring anything.
    pub fn clear<T: TimerEntry>(&mut self, arena: &mut NodeArena<T>) {
        for level in 0..LEVELS {
            for bucket in 0..BUCKETS[level] {
                while let Some(id) = self.wheel[level][bucket].pop_front(arena) {
                    if let Some(entry) = arena.get_mut(id) {
                        entry.set_timer_slot(None);
                    }
                }
            }
        }
        self.nanos = 0;
    }

    /// Picks the finest level whose span still contains the deadline.
    fn locate(&self, deadline: u64) -> (usize, usize) {
        let duration = deadline.saturating_sub(self.nanos);
        for level in 0..LEVELS - 1 {
            if duration < (1u64 << SHIFT[level + 1]) {
                let ticks = deadline >> SHIFT[level];
                let bucket = (ticks & (BUCKETS[level] - 1) as u64) as usize;
                return (level, bucket);
            }
        }
        (LEVELS - 1, 0)
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
