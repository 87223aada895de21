//! The bounded cache engine.
//!
//! A Window-TinyLFU cache: every new entry lands in a small admission
//! *window*; entries evicted from the window must out-score the main
//! region's coldest resident to be admitted. Hot-path reads and writes never
//! touch policy state directly: they publish events into bounded buffers
//! which a single maintenance pass drains under the eviction lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           BoundedCache<K, V>                             │
//! │                                                                          │
//! │  hot paths (lock-free against each other)                                │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │ get ──► DataMap lookup ──► read buffer (lossy)          ┐        │    │
//! │  │ put ──► node monitor   ──► write buffer (lossless)      │ drain  │    │
//! │  │ remove ► retire + unmap ─► write buffer                 │ status │    │
//! │  └─────────────────────────────────────────────────────────┼────────┘    │
//! │                                                            ▼             │
//! │  maintenance (single thread, under the eviction lock)                    │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │ 1 drain reads   → reorder regions, record frequency              │    │
//! │  │ 2 drain writes  → link/unlink nodes, account weights             │    │
//! │  │ 3 expire        → write-order, access-order, timer wheel         │    │
//! │  │ 4 evict         → window candidate vs probation victim (TinyLFU) │    │
//! │  │ 5 climb         → re-partition window vs main                    │    │
//! │  │ 6 pace          → schedule wake-up at next deadline              │    │
//! │  │ 7 epilogue      → drain status back to IDLE, or flag a re-run    │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! │                                                                          │
//! │  regions (access order, LRU at the front)                                │
//! │     window ──► main probation ──► main protected                         │
//! │       candidates     victims        re-accessed residents                │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Drain status
//!
//! A two-bit state word coordinates drain scheduling without blocking:
//!
//! | event \ state       | Idle       | Required   | ProcToIdle | ProcToRequired |
//! |---------------------|------------|------------|------------|----------------|
//! | after write         | Required   | Required   | ProcToReq  | ProcToReq      |
//! | schedule drain      | ProcToIdle*| ProcToIdle*| ProcToIdle | ProcToReq      |
//! | drain completes     | n/a        | n/a        | Idle       | Required       |
//!
//! `*` = the maintenance task is submitted to the executor; these are the
//! only transitions that submit, so double-submission cannot occur. The
//! eviction mutex serializes drain execution regardless of submissions.
//!
//! ## Consistency rules
//!
//! - A node's value, weight, and exit from ALIVE change only under its own
//!   monitor; every eviction path re-checks its cause under that monitor and
//!   aborts if a concurrent write resurrected or refreshed the entry.
//! - All policy state (deques, sketch, maxima, weighted sizes) changes only
//!   under the eviction lock.
//! - Lock order: node monitor → map shard. Key stripes (compute paths) are
//!   taken before any monitor. The maintenance pass takes no stripe, so a
//!   producer draining on overflow cannot deadlock against itself.

use log::warn;
use parking_lot::Mutex;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use crate::ds::buffer::{OfferResult, ReadBuffer, WriteBuffer};
use crate::ds::deque::{Lane, NodeArena, OrderDeque, SlotId};
use crate::ds::timer_wheel::{TimerEntry, TimerWheel};
use crate::policy::admission::TinyLfu;
use crate::policy::climber::HillClimber;
use crate::policy::expiration::{ExpirationPolicy, EXPIRE_WRITE_TOLERANCE};
use crate::policy::pacer::Pacer;
use crate::store::map::DataMap;
use crate::store::node::{Lifecycle, Node, ReferenceStrength, Region, ValueCell};
use crate::traits::{Executor, Listener, RemovalCause, Scheduler, Task, Ticker, Weigher};

/// Largest admissible weighted size.
pub const MAXIMUM_CAPACITY: u64 = i64::MAX as u64;

/// Fraction of the capacity given to the main region at construction.
const PERCENT_MAIN: f64 = 0.99;

/// Fraction of the main region reserved for proven-hot entries.
pub const PERCENT_MAIN_PROTECTED: f64 = 0.80;

/// Push attempts before a writer drains the buffers itself.
const WRITE_BUFFER_RETRIES: usize = 100;

/// Entries moved per climb step; bounds the time spent re-partitioning.
const QUEUE_TRANSFER_THRESHOLD: usize = 1_000;

// Drain-status states. Two bits: bit 1 marks the processing family.
pub(crate) const IDLE: u8 = 0;
pub(crate) const REQUIRED: u8 = 1;
pub(crate) const PROCESSING_TO_IDLE: u8 = 2;
pub(crate) const PROCESSING_TO_REQUIRED: u8 = 3;

// ---------------------------------------------------------------------------
// Policy state
// ---------------------------------------------------------------------------

/// Arena payload: the node plus its timer-wheel coordinates.
#[derive(Debug)]
struct PolicyEntry<K, V> {
    node: Arc<Node<K, V>>,
    timer_slot: Option<(u8, u8)>,
}

impl<K, V> TimerEntry for PolicyEntry<K, V> {
    fn deadline(&self) -> u64 {
        self.node.variable_time()
    }
    fn timer_slot(&self) -> Option<(u8, u8)> {
        self.timer_slot
    }
    fn set_timer_slot(&mut self, slot: Option<(u8, u8)>) {
        self.timer_slot = slot;
    }
}

/// Everything guarded by the eviction lock.
struct PolicyState<K, V> {
    arena: NodeArena<PolicyEntry<K, V>>,
    window: OrderDeque,
    probation: OrderDeque,
    protected: OrderDeque,
    write_order: OrderDeque,
    wheel: TimerWheel,
    admittor: TinyLfu,
    climber: HillClimber,
    pacer: Pacer,
    maximum: u64,
    window_maximum: u64,
    main_protected_maximum: u64,
    weighted_size: u64,
    window_weighted_size: u64,
    main_protected_weighted_size: u64,
}

impl<K, V> PolicyState<K, V> {
    fn new(maximum: u64, initial_capacity: usize) -> Self {
        let mut state = Self {
            arena: NodeArena::with_capacity(initial_capacity),
            window: OrderDeque::new(Lane::Access),
            probation: OrderDeque::new(Lane::Access),
            protected: OrderDeque::new(Lane::Access),
            write_order: OrderDeque::new(Lane::Write),
            wheel: TimerWheel::new(),
            admittor: TinyLfu::new(),
            climber: HillClimber::new(maximum),
            pacer: Pacer::new(),
            maximum: 0,
            window_maximum: 0,
            main_protected_maximum: 0,
            weighted_size: 0,
            window_weighted_size: 0,
            main_protected_weighted_size: 0,
        };
        state.set_maximum(maximum);
        state
    }

    /// Re-derives the region maxima for a new overall maximum.
    fn set_maximum(&mut self, maximum: u64) {
        let maximum = maximum.min(MAXIMUM_CAPACITY);
        let window = maximum - (PERCENT_MAIN * maximum as f64) as u64;
        self.maximum = maximum;
        self.window_maximum = window;
        self.main_protected_maximum =
            ((maximum - window) as f64 * PERCENT_MAIN_PROTECTED) as u64;
        self.climber.set_maximum(maximum);
    }

    fn node(&self, slot: SlotId) -> Arc<Node<K, V>> {
        Arc::clone(&self.arena.get(slot).expect("stale policy slot").node)
    }

    /// First entry with positive weight, scanning `deque` from the given end.
    fn first_weighted(&self, deque: &OrderDeque, from_back: bool) -> Option<SlotId> {
        let iter = if from_back {
            deque.iter_rev(&self.arena)
        } else {
            deque.iter(&self.arena)
        };
        for (slot, entry) in iter {
            if entry.node.policy_weight() > 0 {
                return Some(slot);
            }
        }
        None
    }
}

/// Deferred work produced by the write paths.
enum WriteTask<K, V> {
    /// A new node was inserted and must be linked.
    Add { node: Arc<Node<K, V>>, weight: u32 },
    /// An existing node's value or weight changed.
    Update { node: Arc<Node<K, V>>, new_weight: u32 },
    /// A retired node must be reclaimed from the policy heap.
    Remove { node: Arc<Node<K, V>> },
    /// A reader observed a collected value; evict unless resurrected.
    Collected { node: Arc<Node<K, V>> },
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

/// Shared engine state behind the `BoundedCache` handle.
struct Inner<K, V> {
    data: DataMap<K, V>,
    read_buffer: ReadBuffer<Arc<Node<K, V>>>,
    write_buffer: WriteBuffer<WriteTask<K, V>>,
    eviction_lock: Mutex<PolicyState<K, V>>,
    drain_status: AtomicU8,
    /// Set once the frequency sketch is sized; gates the read-buffer skip.
    policy_warm: AtomicBool,
    evicts: bool,
    value_strength: ReferenceStrength,
    expiration: ExpirationPolicy<K, V>,
    weigher: Arc<dyn Weigher<K, V>>,
    ticker: Arc<dyn Ticker>,
    executor: Arc<dyn Executor>,
    scheduler: Option<Arc<dyn Scheduler>>,
    eviction_listener: Option<Listener<K, V>>,
    removal_listener: Option<Listener<K, V>>,
    self_ref: OnceLock<Weak<Inner<K, V>>>,
}

/// Construction parameters handed over by the builder.
pub(crate) struct CacheConfig<K, V> {
    pub maximum: Option<u64>,
    pub initial_capacity: usize,
    pub shards: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub value_strength: ReferenceStrength,
    pub expiration: ExpirationPolicy<K, V>,
    pub weigher: Arc<dyn Weigher<K, V>>,
    pub ticker: Arc<dyn Ticker>,
    pub executor: Arc<dyn Executor>,
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub eviction_listener: Option<Listener<K, V>>,
    pub removal_listener: Option<Listener<K, V>>,
}

/// Point-in-time engine counters for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugStats {
    pub len: usize,
    pub weighted_size: u64,
    pub read_buffer_reads: usize,
    pub read_buffer_writes: usize,
    pub write_buffer_producer_index: usize,
    pub pacer_scheduled: bool,
    pub pacer_next_fire_time: u64,
}

// ---------------------------------------------------------------------------
// BoundedCache
// ---------------------------------------------------------------------------

/// Concurrent bounded cache with W-TinyLFU admission.
///
/// Cloning the handle shares the underlying cache. Values are shared as
/// `Arc<V>`; `get` returns a clone of the handle, never a copy of the value.
///
/// # Example
///
/// ```
/// use windcache::builder::CacheBuilder;
/// use windcache::cache::BoundedCache;
///
/// let cache: BoundedCache<u64, String> = CacheBuilder::new().maximum_size(100).build();
/// cache.put(1, "one".to_string());
/// assert_eq!(cache.get(&1).as_deref().map(String::as_str), Some("one"));
/// ```
pub struct BoundedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("len", &self.inner.data.len())
            .field("evicts", &self.inner.evicts)
            .finish_non_exhaustive()
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn from_config(config: CacheConfig<K, V>) -> Self {
        let maximum = config.maximum.unwrap_or(MAXIMUM_CAPACITY);
        let inner = Arc::new(Inner {
            data: DataMap::new(config.shards, config.initial_capacity),
            read_buffer: ReadBuffer::with_capacity(config.read_buffer_size),
            write_buffer: WriteBuffer::with_capacity(config.write_buffer_size),
            eviction_lock: Mutex::new(PolicyState::new(maximum, config.initial_capacity)),
            drain_status: AtomicU8::new(IDLE),
            policy_warm: AtomicBool::new(false),
            evicts: config.maximum.is_some(),
            value_strength: config.value_strength,
            expiration: config.expiration,
            weigher: config.weigher,
            ticker: config.ticker,
            executor: config.executor,
            scheduler: config.scheduler,
            eviction_listener: config.eviction_listener,
            removal_listener: config.removal_listener,
            self_ref: OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));
        Self { inner }
    }

    // -- reads ------------------------------------------------------------

    /// Returns the value for `key`, recording the access for the policy.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.get(key)
    }

    /// Returns the value for `key` without loading; identical to [`get`]
    /// (the loader is an external collaborator).
    ///
    /// [`get`]: Self::get
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        self.inner.get(key)
    }

    /// Returns the value without any policy side effects.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.inner.peek(key)
    }

    /// Returns `true` if `key` maps to a live, unexpired entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    // -- writes -----------------------------------------------------------

    /// Inserts or replaces; returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        self.inner.put(key, Arc::new(value), false)
    }

    /// Inserts or replaces a caller-held handle; returns the previous value.
    ///
    /// With weak value references the cache only holds the value while
    /// callers hold the `Arc`, so this is the way to insert a value the
    /// caller intends to keep alive.
    pub fn put_arc(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.inner.put(key, value, false)
    }

    /// Inserts only if absent; returns the existing value otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        self.inner.put(key, Arc::new(value), true)
    }

    /// Replaces the value only if the key is present; returns the previous
    /// value.
    pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
        self.inner.replace(key, Arc::new(value))
    }

    /// Replaces the value only if the key currently maps to `expected`.
    pub fn replace_if(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        self.inner.replace_if(key, expected, Arc::new(value))
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.inner.remove(key)
    }

    /// Removes `key` only if it currently maps to `expected`.
    pub fn remove_if(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.inner.remove_if(key, expected)
    }

    // -- compute ----------------------------------------------------------

    /// Computes a new mapping for `key` under its monitor.
    ///
    /// `remap` receives the current value (`None` if absent or collected)
    /// and returns the replacement; returning `None` removes the entry.
    /// Writers to the same key block for the duration; readers do not.
    pub fn compute<F>(&self, key: K, remap: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K, Option<Arc<V>>) -> Option<V>,
    {
        self.inner.compute(key, remap)
    }

    /// Returns the existing value or inserts the result of `init`.
    pub fn compute_if_absent<F>(&self, key: K, init: F) -> Arc<V>
    where
        F: FnOnce(&K) -> V,
    {
        self.inner.compute_if_absent(key, init)
    }

    /// Remaps the value only if present; returning `None` removes it.
    pub fn compute_if_present<F>(&self, key: &K, remap: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K, Arc<V>) -> Option<V>,
    {
        self.inner.compute_if_present(key, remap)
    }

    /// Inserts `value` if absent, else replaces with `merge(old, value)`.
    pub fn merge<F>(&self, key: K, value: V, merge: F) -> Arc<V>
    where
        F: FnOnce(Arc<V>, V) -> V,
    {
        self.inner.merge(key, value, merge)
    }

    // -- bulk and maintenance ---------------------------------------------

    /// Removes every entry, notifying with cause `Explicit`.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Alias of [`invalidate_all`](Self::invalidate_all).
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Runs a synchronous maintenance pass: drains the buffers, applies
    /// expirations and evictions, and re-arms the pacer.
    pub fn clean_up(&self) {
        self.inner.perform_clean_up();
    }

    /// Number of mapped entries (including those pending reclamation).
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Returns `true` if no entries are mapped.
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Combined weight of resident entries, as accounted by the policy.
    pub fn weighted_size(&self) -> u64 {
        self.inner.eviction_lock.lock().weighted_size
    }

    // -- policy introspection ---------------------------------------------

    /// Entries in eviction order: window LRU first, then main-probation LRU,
    /// then main-protected LRU. Runs a maintenance pass first so the order
    /// reflects all published events.
    pub fn coldest(&self, limit: usize) -> Vec<(K, Arc<V>)> {
        self.inner.coldest(limit)
    }

    /// Entries in eviction order up to a combined weight instead of a count.
    pub fn coldest_weighted(&self, max_weight: u64) -> Vec<(K, Arc<V>)> {
        self.inner.coldest_weighted(max_weight)
    }

    /// Entries in retention order: the reverse of [`coldest`](Self::coldest).
    pub fn hottest(&self, limit: usize) -> Vec<(K, Arc<V>)> {
        self.inner.hottest(limit)
    }

    /// The maximum weighted size, if bounded.
    pub fn maximum(&self) -> Option<u64> {
        self.inner
            .evicts
            .then(|| self.inner.eviction_lock.lock().maximum)
    }

    /// Adjusts the maximum weighted size and immediately enforces it.
    /// No-op on an unbounded cache.
    pub fn set_maximum(&self, maximum: u64) {
        self.inner.set_maximum(maximum);
    }

    /// Adjusts (or disables) the fixed after-access expiration.
    pub fn set_expires_after_access(&self, duration: Option<Duration>) {
        self.inner
            .expiration
            .set_access_nanos(duration.map(|d| d.as_nanos() as u64));
    }

    /// Adjusts (or disables) the fixed after-write expiration.
    pub fn set_expires_after_write(&self, duration: Option<Duration>) {
        self.inner
            .expiration
            .set_write_nanos(duration.map(|d| d.as_nanos() as u64));
    }

    /// Snapshots engine counters.
    pub fn debug_stats(&self) -> DebugStats {
        self.inner.debug_stats()
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<Inner<K, V>> {
        &self.inner
    }
}

// ---------------------------------------------------------------------------
// Engine implementation
// ---------------------------------------------------------------------------

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    #[inline]
    fn now(&self) -> u64 {
        self.ticker.read()
    }

    #[inline]
    fn drain_status(&self) -> u8 {
        self.drain_status.load(Ordering::Acquire)
    }

    // -- hot-path reads ---------------------------------------------------

    fn get(&self, key: &K) -> Option<Arc<V>> {
        let now = self.now();
        let hash = self.data.hash(key);
        let node = self.data.get(key, hash)?;
        if !node.is_alive() {
            return None;
        }
        if self.expiration.is_expired(
            node.access_time(),
            node.write_time(),
            node.variable_time(),
            now,
        ) {
            // Surface as absent; the drain reclaims it.
            self.schedule_drain_buffers();
            return None;
        }
        let value = match node.value() {
            Some(value) => value,
            None => {
                // Collected; hand the node to the drain, which evicts it
                // with cause `Collected` unless a write resurrects it first.
                self.after_write(WriteTask::Collected { node });
                return None;
            }
        };
        if let Some(expiry) = self.expiration.expiry() {
            let current = node.variable_time().saturating_sub(now);
            let duration = expiry.expire_after_read(key, &value, now, current);
            node.set_variable_time(now.saturating_add(duration));
        }
        self.after_read(&node, now);
        Some(value)
    }

    fn peek(&self, key: &K) -> Option<Arc<V>> {
        let now = self.now();
        let hash = self.data.hash(key);
        let node = self.data.get(key, hash)?;
        if !node.is_alive()
            || self.expiration.is_expired(
                node.access_time(),
                node.write_time(),
                node.variable_time(),
                now,
            )
        {
            return None;
        }
        node.value()
    }

    /// Publishes a read event, unless no policy currently needs recency.
    fn after_read(&self, node: &Arc<Node<K, V>>, now: u64) {
        node.set_access_time(now);
        if self.skip_read_buffer() {
            return;
        }
        let full = self.read_buffer.offer(Arc::clone(node)) == OfferResult::Full;
        if full || self.drain_status() == REQUIRED {
            self.schedule_drain_buffers();
        }
    }

    /// Reads need no buffering while nothing consumes recency: no
    /// access-based expiration, and either no bound or a frequency sketch
    /// still cold (it warms at half capacity).
    fn skip_read_buffer(&self) -> bool {
        if self.expiration.expires_after_access() || self.expiration.has_variable() {
            return false;
        }
        !self.evicts || !self.policy_warm.load(Ordering::Relaxed)
    }

    // -- hot-path writes --------------------------------------------------

    fn put(&self, key: K, value: Arc<V>, only_if_absent: bool) -> Option<Arc<V>> {
        let hash = self.data.hash(&key);
        loop {
            let now = self.now();
            let Some(node) = self.data.get(&key, hash) else {
                // User callbacks run before any mutation.
                let weight = self.weigher.weigh(&key, &value);
                let node = self.new_node(&key, hash, &value, weight);
                {
                    let _stripe = self.data.key_stripe(hash);
                    if self.data.get(&key, hash).is_some() {
                        continue;
                    }
                    self.insert_new(&key, hash, &node);
                }
                self.after_write(WriteTask::Add { node, weight });
                return None;
            };
            if !node.is_alive() {
                // A retiring writer is between unmapping steps.
                std::thread::yield_now();
                continue;
            }
            let weight = self.weigher.weigh(&key, &value);
            let guard = node.lock();
            if !node.is_alive() {
                drop(guard);
                continue;
            }
            let raw = guard.value();
            let (current, stale_cause) = self.live_value(&node, &raw, now);
            if only_if_absent {
                if let Some(existing) = current {
                    drop(guard);
                    self.after_read(&node, now);
                    return Some(existing);
                }
            }
            let as_write = self.install(&node, guard, &key, &value, weight, now, current.is_some());
            match stale_cause {
                Some(cause) => self.notify_displaced(&node, raw, cause),
                None if !only_if_absent => {
                    self.notify_removal(&node, raw, RemovalCause::Replaced);
                }
                None => {}
            }
            self.publish_update(&node, as_write, now);
            return current;
        }
    }

    fn replace(&self, key: &K, value: Arc<V>) -> Option<Arc<V>> {
        let hash = self.data.hash(key);
        loop {
            let now = self.now();
            let node = self.data.get(key, hash)?;
            if !node.is_alive() {
                std::thread::yield_now();
                continue;
            }
            let weight = self.weigher.weigh(key, &value);
            let guard = node.lock();
            if !node.is_alive() {
                drop(guard);
                continue;
            }
            let raw = guard.value();
            let (current, _stale_cause) = self.live_value(&node, &raw, now);
            // Collected and expired mappings read as absent; replace declines.
            let Some(old) = current else {
                return None;
            };
            let as_write = self.install(&node, guard, key, &value, weight, now, true);
            self.notify_removal(&node, Some(Arc::clone(&old)), RemovalCause::Replaced);
            self.publish_update(&node, as_write, now);
            return Some(old);
        }
    }

    fn replace_if(&self, key: &K, expected: &V, value: Arc<V>) -> bool
    where
        V: PartialEq,
    {
        let hash = self.data.hash(key);
        loop {
            let now = self.now();
            let Some(node) = self.data.get(key, hash) else {
                return false;
            };
            if !node.is_alive() {
                std::thread::yield_now();
                continue;
            }
            let weight = self.weigher.weigh(key, &value);
            let guard = node.lock();
            if !node.is_alive() {
                drop(guard);
                continue;
            }
            let raw = guard.value();
            let (current, _stale_cause) = self.live_value(&node, &raw, now);
            let Some(old) = current else {
                return false;
            };
            if *old != *expected {
                return false;
            }
            let as_write = self.install(&node, guard, key, &value, weight, now, true);
            self.notify_removal(&node, Some(old), RemovalCause::Replaced);
            self.publish_update(&node, as_write, now);
            return true;
        }
    }

    fn remove(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.data.hash(key);
        loop {
            let now = self.now();
            let node = self.data.get(key, hash)?;
            let guard = node.lock();
            if !node.is_alive() {
                drop(guard);
                std::thread::yield_now();
                continue;
            }
            let raw = guard.value();
            let (current, stale_cause) = self.live_value(&node, &raw, now);
            node.retire();
            self.data.remove_if_same(key, hash, &node);
            drop(guard);

            self.notify_displaced(&node, raw, stale_cause.unwrap_or(RemovalCause::Explicit));
            self.after_write(WriteTask::Remove { node });
            return current;
        }
    }

    fn remove_if(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let hash = self.data.hash(key);
        loop {
            let now = self.now();
            let Some(node) = self.data.get(key, hash) else {
                return false;
            };
            let guard = node.lock();
            if !node.is_alive() {
                drop(guard);
                std::thread::yield_now();
                continue;
            }
            let raw = guard.value();
            let (current, _stale_cause) = self.live_value(&node, &raw, now);
            match current {
                Some(old) if *old == *expected => {
                    node.retire();
                    self.data.remove_if_same(key, hash, &node);
                    drop(guard);
                    self.notify_removal(&node, Some(old), RemovalCause::Explicit);
                    self.after_write(WriteTask::Remove { node });
                    return true;
                }
                _ => return false,
            }
        }
    }

    // -- update plumbing --------------------------------------------------

    fn new_node(&self, key: &K, hash: u64, value: &Arc<V>, weight: u32) -> Arc<Node<K, V>> {
        let now = self.now();
        let node = Arc::new(Node::new(
            key.clone(),
            hash,
            Arc::clone(value),
            self.value_strength,
            weight,
            now,
        ));
        if let Some(expiry) = self.expiration.expiry() {
            let duration = expiry.expire_after_create(key, value, now);
            node.set_variable_time(now.saturating_add(duration));
        }
        node
    }

    /// Maps a raw value cell reading to what a writer should see: collected
    /// and expired mappings read as absent, carrying the cause their
    /// replacement must report for the displaced mapping.
    fn live_value(
        &self,
        node: &Node<K, V>,
        raw: &Option<Arc<V>>,
        now: u64,
    ) -> (Option<Arc<V>>, Option<RemovalCause>) {
        let Some(value) = raw else {
            return (None, Some(RemovalCause::Collected));
        };
        if self.expiration.is_expired(
            node.access_time(),
            node.write_time(),
            node.variable_time(),
            now,
        ) {
            (None, Some(RemovalCause::Expired))
        } else {
            (Some(Arc::clone(value)), None)
        }
    }

    /// Installs a new value under the node monitor, returning whether the
    /// update must be buffered as a write.
    ///
    /// An update coalesces into a read only when the previous mapping was
    /// live, the weight is unchanged, and the write (or the variable
    /// deadline shift) stays within the tolerance.
    fn install(
        &self,
        node: &Arc<Node<K, V>>,
        mut guard: parking_lot::MutexGuard<'_, ValueCell<V>>,
        key: &K,
        value: &Arc<V>,
        weight: u32,
        now: u64,
        had_live_value: bool,
    ) -> bool {
        let old_weight = guard.weight();
        let mut exceeds_tolerance = false;

        if let Some(expiry) = self.expiration.expiry() {
            let old_deadline = node.variable_time();
            let current = old_deadline.saturating_sub(now);
            let duration = expiry.expire_after_update(key, value, now, current);
            let new_deadline = now.saturating_add(duration);
            exceeds_tolerance |= old_deadline.abs_diff(new_deadline) > EXPIRE_WRITE_TOLERANCE;
            node.set_variable_time(new_deadline);
        }
        if self.expiration.expires_after_write() {
            exceeds_tolerance |= now.saturating_sub(node.write_time()) > EXPIRE_WRITE_TOLERANCE;
        }

        guard.set(Arc::clone(value), self.value_strength, weight);
        let as_write = !had_live_value || weight != old_weight || exceeds_tolerance;
        if as_write {
            node.set_write_time(now);
        }
        drop(guard);
        as_write
    }

    /// Publishes the buffered event chosen by [`install`](Self::install).
    fn publish_update(&self, node: &Arc<Node<K, V>>, as_write: bool, now: u64) {
        if as_write {
            let weight = node.lock().weight();
            self.after_write(WriteTask::Update {
                node: Arc::clone(node),
                new_weight: weight,
            });
        } else {
            self.after_read(node, now);
        }
    }

    /// Publishes a fresh node into the map. The caller holds the key
    /// stripe, so the only possible occupant is a retiring node between its
    /// unmapping steps; wait that window out.
    fn insert_new(&self, key: &K, hash: u64, node: &Arc<Node<K, V>>) {
        loop {
            match self.data.try_insert(key.clone(), hash, Arc::clone(node)) {
                Ok(()) => return,
                Err(existing) => {
                    debug_assert!(!existing.is_alive());
                    std::thread::yield_now();
                }
            }
        }
    }

    // -- compute family ---------------------------------------------------

    fn compute<F>(&self, key: K, remap: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K, Option<Arc<V>>) -> Option<V>,
    {
        let hash = self.data.hash(&key);
        let _stripe = self.data.key_stripe(hash);
        let mut remap = Some(remap);
        loop {
            let now = self.now();
            match self.data.get(&key, hash) {
                Some(node) => {
                    let guard = node.lock();
                    if !node.is_alive() {
                        drop(guard);
                        std::thread::yield_now();
                        continue;
                    }
                    let raw = guard.value();
                    let (current, stale_cause) = self.live_value(&node, &raw, now);
                    let remap = remap.take().expect("remap consumed twice");
                    return match remap(&key, current.clone()) {
                        Some(new_value) => {
                            let value = Arc::new(new_value);
                            let weight = self.weigher.weigh(&key, &value);
                            let as_write = self
                                .install(&node, guard, &key, &value, weight, now, current.is_some());
                            match stale_cause {
                                Some(cause) => self.notify_displaced(&node, raw, cause),
                                None => self.notify_removal(&node, raw, RemovalCause::Replaced),
                            }
                            self.publish_update(&node, as_write, now);
                            Some(value)
                        }
                        None => {
                            node.retire();
                            self.data.remove_if_same(&key, hash, &node);
                            drop(guard);
                            self.notify_displaced(
                                &node,
                                raw,
                                stale_cause.unwrap_or(RemovalCause::Explicit),
                            );
                            self.after_write(WriteTask::Remove { node });
                            None
                        }
                    };
                }
                None => {
                    let remap = remap.take().expect("remap consumed twice");
                    return match remap(&key, None) {
                        Some(new_value) => {
                            let value = Arc::new(new_value);
                            let weight = self.weigher.weigh(&key, &value);
                            let node = self.new_node(&key, hash, &value, weight);
                            self.insert_new(&key, hash, &node);
                            self.after_write(WriteTask::Add { node, weight });
                            Some(value)
                        }
                        None => None,
                    };
                }
            }
        }
    }

    fn compute_if_absent<F>(&self, key: K, init: F) -> Arc<V>
    where
        F: FnOnce(&K) -> V,
    {
        let hash = self.data.hash(&key);
        // Fast path: a live mapping needs no stripe.
        {
            let now = self.now();
            if let Some(node) = self.data.get(&key, hash) {
                if node.is_alive() {
                    let raw = node.value();
                    if let (Some(existing), _) = self.live_value(&node, &raw, now) {
                        self.after_read(&node, now);
                        return existing;
                    }
                }
            }
        }

        let _stripe = self.data.key_stripe(hash);
        let mut init = Some(init);
        loop {
            let now = self.now();
            match self.data.get(&key, hash) {
                Some(node) => {
                    let guard = node.lock();
                    if !node.is_alive() {
                        drop(guard);
                        std::thread::yield_now();
                        continue;
                    }
                    let raw = guard.value();
                    let (current, stale_cause) = self.live_value(&node, &raw, now);
                    if let Some(existing) = current {
                        drop(guard);
                        self.after_read(&node, now);
                        return existing;
                    }
                    // Collected or expired: install a fresh value in place.
                    let init = init.take().expect("init consumed twice");
                    let value = Arc::new(init(&key));
                    let weight = self.weigher.weigh(&key, &value);
                    let as_write = self.install(&node, guard, &key, &value, weight, now, false);
                    if let Some(cause) = stale_cause {
                        self.notify_displaced(&node, raw, cause);
                    }
                    self.publish_update(&node, as_write, now);
                    return value;
                }
                None => {
                    let init = init.take().expect("init consumed twice");
                    let value = Arc::new(init(&key));
                    let weight = self.weigher.weigh(&key, &value);
                    let node = self.new_node(&key, hash, &value, weight);
                    self.insert_new(&key, hash, &node);
                    self.after_write(WriteTask::Add { node, weight });
                    return value;
                }
            }
        }
    }

    fn compute_if_present<F>(&self, key: &K, remap: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K, Arc<V>) -> Option<V>,
    {
        let mut remap = Some(remap);
        self.compute(key.clone(), |key, current| {
            let current = current?;
            (remap.take().expect("remap consumed twice"))(key, current)
        })
    }

    fn merge<F>(&self, key: K, value: V, merge: F) -> Arc<V>
    where
        F: FnOnce(Arc<V>, V) -> V,
    {
        let mut state = Some((value, merge));
        self.compute(key, |_key, current| {
            let (value, merge) = state.take().expect("merge consumed twice");
            Some(match current {
                Some(existing) => merge(existing, value),
                None => value,
            })
        })
        .expect("merge always yields a value")
    }

    // -- event publication ------------------------------------------------

    /// Queues a write task; when the buffer stays full, drains it on this
    /// thread so the task is observed to run before returning.
    fn after_write(&self, task: WriteTask<K, V>) {
        let mut task = task;
        for _ in 0..WRITE_BUFFER_RETRIES {
            match self.write_buffer.try_push(task) {
                Ok(()) => {
                    self.schedule_after_write();
                    return;
                }
                Err(returned) => {
                    task = returned;
                    self.schedule_drain_buffers();
                    std::thread::yield_now();
                }
            }
        }
        warn!("write buffer saturated; draining on the writer thread");
        let mut policy = self.eviction_lock.lock();
        self.maintenance(&mut policy, Some(task));
    }

    /// Drain-status transition for a published write. Returns `true` when
    /// the caller must also request a drain submission.
    fn advance_status_after_write(&self) -> bool {
        loop {
            match self.drain_status() {
                IDLE => {
                    let _ = self.drain_status.compare_exchange(
                        IDLE,
                        REQUIRED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                REQUIRED => return true,
                PROCESSING_TO_IDLE => {
                    if self
                        .drain_status
                        .compare_exchange(
                            PROCESSING_TO_IDLE,
                            PROCESSING_TO_REQUIRED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return false;
                    }
                }
                _ => return false, // PROCESSING_TO_REQUIRED
            }
        }
    }

    fn schedule_after_write(&self) {
        if self.advance_status_after_write() {
            self.schedule_drain_buffers();
        }
    }

    /// Moves the status into the processing family and submits the drain
    /// task; exactly one submission per idle→processing transition. A
    /// rejecting executor degrades to a synchronous drain.
    fn schedule_drain_buffers(&self) {
        loop {
            let status = self.drain_status();
            if status >= PROCESSING_TO_IDLE {
                return;
            }
            if self
                .drain_status
                .compare_exchange(status, PROCESSING_TO_IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let action = self.drain_action();
        let task: Task = {
            let action = Arc::clone(&action);
            Box::new(move || action())
        };
        if self.executor.execute(task).is_err() {
            log::debug!("executor rejected the maintenance task; draining synchronously");
            action();
        }
    }

    fn drain_action(&self) -> Arc<dyn Fn() + Send + Sync> {
        let weak = self.self_ref.get().cloned().unwrap_or_default();
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.perform_clean_up();
            }
        })
    }

    /// Locks the policy state and runs one maintenance pass; re-requests a
    /// drain if more work arrived while running.
    fn perform_clean_up(&self) {
        let mut policy = self.eviction_lock.lock();
        self.maintenance(&mut policy, None);
        drop(policy);
        if self.drain_status() == REQUIRED {
            self.schedule_drain_buffers();
        }
    }

    // -- maintenance ------------------------------------------------------

    fn maintenance(&self, policy: &mut PolicyState<K, V>, extra: Option<WriteTask<K, V>>) {
        self.drain_status
            .store(PROCESSING_TO_IDLE, Ordering::Release);

        self.drain_read_buffer(policy);
        self.drain_write_buffer(policy);
        if let Some(task) = extra {
            self.run_write_task(policy, task);
        }

        let now = self.now();
        self.expire_entries(policy, now);
        if self.evicts {
            self.evict_entries(policy);
        }
        self.climb(policy);
        self.schedule_pacing(policy, now);

        if self
            .drain_status
            .compare_exchange(
                PROCESSING_TO_IDLE,
                IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.drain_status.store(REQUIRED, Ordering::Release);
        }
    }

    fn drain_read_buffer(&self, policy: &mut PolicyState<K, V>) {
        self.read_buffer
            .drain_with(|node| self.on_access(policy, &node));
    }

    fn drain_write_buffer(&self, policy: &mut PolicyState<K, V>) {
        while let Some(task) = self.write_buffer.pop() {
            self.run_write_task(policy, task);
        }
    }

    /// Applies one read event: reorder within the region, promote probation
    /// hits, record popularity.
    fn on_access(&self, policy: &mut PolicyState<K, V>, node: &Arc<Node<K, V>>) {
        let Some(slot) = node.slot() else {
            // Never linked (the add event may still be queued) or already
            // reclaimed; popularity is still worth recording.
            if node.is_alive() {
                policy.admittor.record(node.key_hash());
            }
            return;
        };
        policy.admittor.record(node.key_hash());
        policy.climber.on_hit();
        self.reorder(policy, node, slot);
    }

    fn reorder(&self, policy: &mut PolicyState<K, V>, node: &Arc<Node<K, V>>, slot: SlotId) {
        match node.region() {
            Region::Window => {
                policy.window.move_to_back(&mut policy.arena, slot);
            }
            Region::MainProbation => {
                policy.probation.unlink(&mut policy.arena, slot);
                policy.protected.push_back(&mut policy.arena, slot);
                node.set_region(Region::MainProtected);
                policy.main_protected_weighted_size += u64::from(node.policy_weight());
                self.demote_protected(policy);
            }
            Region::MainProtected => {
                policy.protected.move_to_back(&mut policy.arena, slot);
            }
        }
        if self.expiration.has_variable() {
            policy.wheel.reschedule(&mut policy.arena, slot);
        }
    }

    /// Sheds protected LRU entries back to probation until under the cap.
    fn demote_protected(&self, policy: &mut PolicyState<K, V>) {
        while policy.main_protected_weighted_size > policy.main_protected_maximum {
            let Some(slot) = policy.protected.pop_front(&mut policy.arena) else {
                break;
            };
            let node = policy.node(slot);
            node.set_region(Region::MainProbation);
            policy.probation.push_back(&mut policy.arena, slot);
            policy.main_protected_weighted_size = policy
                .main_protected_weighted_size
                .saturating_sub(u64::from(node.policy_weight()));
        }
    }

    fn run_write_task(&self, policy: &mut PolicyState<K, V>, task: WriteTask<K, V>) {
        match task {
            WriteTask::Add { node, weight } => self.on_add(policy, node, weight),
            WriteTask::Update { node, new_weight } => self.on_update(policy, node, new_weight),
            WriteTask::Remove { node } => self.finalize(policy, &node),
            WriteTask::Collected { node } => {
                self.evict_entry(policy, &node, RemovalCause::Collected, self.now());
            }
        }
    }

    fn on_add(&self, policy: &mut PolicyState<K, V>, node: Arc<Node<K, V>>, weight: u32) {
        policy.climber.on_miss();
        policy.admittor.record(node.key_hash());
        if !node.is_alive() {
            // Retired before the event drained; its removal task follows.
            return;
        }

        let slot = policy.arena.insert(PolicyEntry {
            node: Arc::clone(&node),
            timer_slot: None,
        });
        node.set_slot(Some(slot));
        node.set_policy_weight(weight);
        node.set_region(Region::Window);
        policy.window.push_back(&mut policy.arena, slot);
        policy.weighted_size += u64::from(weight);
        policy.window_weighted_size += u64::from(weight);

        if self.expiration.expires_after_write() {
            policy.write_order.push_back(&mut policy.arena, slot);
        }
        if self.expiration.has_variable() {
            policy.wheel.schedule(&mut policy.arena, slot);
        }

        if self.evicts {
            if !policy.admittor.is_warm() && policy.weighted_size >= policy.maximum / 2 {
                policy.admittor.ensure_capacity(policy.maximum);
                self.policy_warm.store(true, Ordering::Release);
            }
            if u64::from(weight) > policy.maximum {
                // Too big to ever fit; disappears atomically with cause Size.
                self.evict_entry(policy, &node, RemovalCause::Size, self.now());
            }
        }
    }

    fn on_update(&self, policy: &mut PolicyState<K, V>, node: Arc<Node<K, V>>, new_weight: u32) {
        let Some(slot) = node.slot() else {
            node.set_policy_weight(new_weight);
            return;
        };
        let old_weight = node.policy_weight();
        node.set_policy_weight(new_weight);

        let grow = u64::from(new_weight);
        let shrink = u64::from(old_weight);
        policy.weighted_size = (policy.weighted_size + grow).saturating_sub(shrink);
        match node.region() {
            Region::Window => {
                policy.window_weighted_size =
                    (policy.window_weighted_size + grow).saturating_sub(shrink);
            }
            Region::MainProtected => {
                policy.main_protected_weighted_size =
                    (policy.main_protected_weighted_size + grow).saturating_sub(shrink);
            }
            Region::MainProbation => {}
        }

        policy.admittor.record(node.key_hash());
        self.reorder(policy, &node, slot);
        if self.expiration.expires_after_write() {
            policy.write_order.move_to_back(&mut policy.arena, slot);
        }

        if self.evicts && u64::from(new_weight) > policy.maximum {
            self.evict_entry(policy, &node, RemovalCause::Size, self.now());
        }
    }

    /// Reclaims a node from the policy heap and completes its lifecycle.
    fn finalize(&self, policy: &mut PolicyState<K, V>, node: &Arc<Node<K, V>>) {
        if let Some(slot) = node.slot() {
            let weight = u64::from(node.policy_weight());
            match node.region() {
                Region::Window => {
                    policy.window.unlink(&mut policy.arena, slot);
                    policy.window_weighted_size =
                        policy.window_weighted_size.saturating_sub(weight);
                }
                Region::MainProbation => {
                    policy.probation.unlink(&mut policy.arena, slot);
                }
                Region::MainProtected => {
                    policy.protected.unlink(&mut policy.arena, slot);
                    policy.main_protected_weighted_size =
                        policy.main_protected_weighted_size.saturating_sub(weight);
                }
            }
            policy.write_order.unlink(&mut policy.arena, slot);
            policy.wheel.deschedule(&mut policy.arena, slot);
            policy.arena.remove(slot);
            node.set_slot(None);
            policy.weighted_size = policy.weighted_size.saturating_sub(weight);
        }
        if !node.is_dead() {
            node.die();
        }
    }

    // -- eviction ---------------------------------------------------------

    /// Evicts `node` with the given cause after re-checking it under the
    /// node monitor; aborts (returning `false`) when a concurrent write
    /// resurrected or refreshed the entry.
    fn evict_entry(
        &self,
        policy: &mut PolicyState<K, V>,
        node: &Arc<Node<K, V>>,
        cause: RemovalCause,
        now: u64,
    ) -> bool {
        let mut retired_here = false;
        let mut actual_cause = cause;
        let mut retained_value = None;
        {
            let guard = node.lock();
            match node.lifecycle() {
                Lifecycle::Alive => {
                    let live_value = guard.value();
                    let resurrected = match cause {
                        RemovalCause::Expired => !self.expiration.is_expired(
                            node.access_time(),
                            node.write_time(),
                            node.variable_time(),
                            now,
                        ),
                        RemovalCause::Collected => live_value.is_some(),
                        _ => false,
                    };
                    if resurrected {
                        return false;
                    }
                    if live_value.is_none() {
                        actual_cause = RemovalCause::Collected;
                    }
                    node.retire();
                    self.data.remove_if_same(node.key(), node.key_hash(), node);
                    retained_value = live_value;
                    retired_here = true;
                }
                Lifecycle::Retired => {
                    // A writer already unmapped and notified; just reclaim.
                }
                Lifecycle::Dead => return false,
            }
            drop(guard);
        }

        if retired_here {
            if actual_cause.was_evicted() {
                self.notify_eviction(node.key(), retained_value.clone(), actual_cause);
            }
            self.notify_removal(node, retained_value, actual_cause);
        }
        self.finalize(policy, node);
        true
    }

    fn evict_entries(&self, policy: &mut PolicyState<K, V>) {
        let candidates = self.evict_from_window(policy);
        self.evict_from_main(policy, candidates);
    }

    /// Demotes window LRU entries into probation until the window fits,
    /// returning how many candidates await admission.
    fn evict_from_window(&self, policy: &mut PolicyState<K, V>) -> usize {
        let mut candidates = 0;
        while policy.window_weighted_size > policy.window_maximum {
            let Some(slot) = policy.window.pop_front(&mut policy.arena) else {
                break;
            };
            let node = policy.node(slot);
            node.set_region(Region::MainProbation);
            policy.probation.push_back(&mut policy.arena, slot);
            policy.window_weighted_size = policy
                .window_weighted_size
                .saturating_sub(u64::from(node.policy_weight()));
            candidates += 1;
        }
        candidates
    }

    /// Restores the capacity bound: each round pits the newest window
    /// candidate (probation MRU) against the coldest victim (probation LRU)
    /// and evicts the admission loser.
    fn evict_from_main(&self, policy: &mut PolicyState<K, V>, mut candidates: usize) {
        while policy.weighted_size > policy.maximum {
            let victim = policy.first_weighted(&policy.probation, false);
            let candidate = if candidates == 0 {
                None
            } else {
                policy.first_weighted(&policy.probation, true)
            };

            let (evictee, was_candidate) = match (victim, candidate) {
                (None, None) => {
                    // Probation is out of weight; fall back on the other
                    // regions in eviction order.
                    if let Some(slot) = policy.first_weighted(&policy.protected, false) {
                        (slot, false)
                    } else if let Some(slot) = policy.first_weighted(&policy.window, false) {
                        (slot, false)
                    } else {
                        break;
                    }
                }
                (Some(victim), None) => (victim, false),
                (None, Some(candidate)) => (candidate, true),
                (Some(victim), Some(candidate)) if victim == candidate => (victim, false),
                (Some(victim), Some(candidate)) => {
                    let victim_node = policy.node(victim);
                    let candidate_node = policy.node(candidate);
                    if u64::from(candidate_node.policy_weight()) > policy.maximum {
                        (candidate, true)
                    } else if u64::from(victim_node.policy_weight()) > policy.maximum {
                        (victim, false)
                    } else if policy
                        .admittor
                        .admit(candidate_node.key_hash(), victim_node.key_hash())
                    {
                        (victim, false)
                    } else {
                        (candidate, true)
                    }
                }
            };

            if was_candidate {
                candidates = candidates.saturating_sub(1);
            }
            let node = policy.node(evictee);
            self.evict_entry(policy, &node, RemovalCause::Size, self.now());
            if node.slot().is_some() {
                // Could not reclaim; bail rather than spin.
                break;
            }
        }
    }

    // -- expiration -------------------------------------------------------

    fn expire_entries(&self, policy: &mut PolicyState<K, V>, now: u64) {
        if let Some(nanos) = self.expiration.write_nanos() {
            loop {
                let Some(slot) = policy.write_order.peek_front() else {
                    break;
                };
                let node = policy.node(slot);
                if now.saturating_sub(node.write_time()) < nanos {
                    break;
                }
                if !self.evict_entry(policy, &node, RemovalCause::Expired, now) {
                    // Refreshed concurrently; re-sort and continue.
                    policy.write_order.move_to_back(&mut policy.arena, slot);
                }
            }
        }
        if let Some(nanos) = self.expiration.access_nanos() {
            for region in [Region::Window, Region::MainProbation, Region::MainProtected] {
                self.expire_access_region(policy, region, nanos, now);
            }
        }
        if self.expiration.has_variable() {
            for slot in policy.wheel.advance(&mut policy.arena, now) {
                let node = policy.node(slot);
                if !self.evict_entry(policy, &node, RemovalCause::Expired, now) {
                    policy.wheel.schedule(&mut policy.arena, slot);
                }
            }
        }
    }

    fn expire_access_region(
        &self,
        policy: &mut PolicyState<K, V>,
        region: Region,
        nanos: u64,
        now: u64,
    ) {
        loop {
            let head = match region {
                Region::Window => policy.window.peek_front(),
                Region::MainProbation => policy.probation.peek_front(),
                Region::MainProtected => policy.protected.peek_front(),
            };
            let Some(slot) = head else { break };
            let node = policy.node(slot);
            if now.saturating_sub(node.access_time()) < nanos {
                break;
            }
            if !self.evict_entry(policy, &node, RemovalCause::Expired, now) {
                let deque = match region {
                    Region::Window => &mut policy.window,
                    Region::MainProbation => &mut policy.probation,
                    Region::MainProtected => &mut policy.protected,
                };
                deque.move_to_back(&mut policy.arena, slot);
            }
        }
    }

    // -- adaptation -------------------------------------------------------

    fn climb(&self, policy: &mut PolicyState<K, V>) {
        if !self.evicts {
            return;
        }
        let amount = policy.climber.adjustment(policy.maximum);
        self.demote_protected(policy);
        if amount > 0.0 {
            self.increase_window(policy, amount);
        } else if amount < 0.0 {
            self.decrease_window(policy, -amount);
        }
    }

    /// Grows the window by taking quota (and entries) from main.
    fn increase_window(&self, policy: &mut PolicyState<K, V>, amount: f64) {
        if policy.main_protected_maximum == 0 {
            return;
        }
        let mut quota = (amount as u64).min(policy.main_protected_maximum);
        policy.main_protected_maximum -= quota;
        policy.window_maximum += quota;
        self.demote_protected(policy);

        for _ in 0..QUEUE_TRANSFER_THRESHOLD {
            let mut from_probation = true;
            let mut candidate = policy.probation.peek_front();
            let candidate_weight = candidate
                .map(|slot| u64::from(policy.node(slot).policy_weight()))
                .unwrap_or(u64::MAX);
            if candidate.is_none() || candidate_weight > quota {
                candidate = policy.protected.peek_front();
                from_probation = false;
            }
            let Some(slot) = candidate else { break };

            let node = policy.node(slot);
            let weight = u64::from(node.policy_weight());
            if weight > quota {
                break;
            }
            quota -= weight;
            if from_probation {
                policy.probation.unlink(&mut policy.arena, slot);
            } else {
                policy.protected.unlink(&mut policy.arena, slot);
                policy.main_protected_weighted_size =
                    policy.main_protected_weighted_size.saturating_sub(weight);
            }
            policy.window.push_back(&mut policy.arena, slot);
            node.set_region(Region::Window);
            policy.window_weighted_size += weight;
        }

        // Return whatever quota no entry could fill.
        policy.main_protected_maximum += quota;
        policy.window_maximum -= quota;
    }

    /// Shrinks the window, handing quota (and entries) back to main.
    fn decrease_window(&self, policy: &mut PolicyState<K, V>, amount: f64) {
        if policy.window_maximum <= 1 {
            return;
        }
        let mut quota = (amount as u64).min(policy.window_maximum - 1);
        policy.main_protected_maximum += quota;
        policy.window_maximum -= quota;

        for _ in 0..QUEUE_TRANSFER_THRESHOLD {
            let Some(slot) = policy.window.peek_front() else { break };
            let node = policy.node(slot);
            let weight = u64::from(node.policy_weight());
            if weight > quota {
                break;
            }
            quota -= weight;
            policy.window.unlink(&mut policy.arena, slot);
            policy.window_weighted_size = policy.window_weighted_size.saturating_sub(weight);
            policy.probation.push_back(&mut policy.arena, slot);
            node.set_region(Region::MainProbation);
        }

        policy.main_protected_maximum -= quota;
        policy.window_maximum += quota;
    }

    // -- pacing -----------------------------------------------------------

    /// Arms the pacer for the earliest future deadline, or stands it down
    /// when nothing is pending.
    fn schedule_pacing(&self, policy: &mut PolicyState<K, V>, now: u64) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if !self.expiration.expires() {
            return;
        }

        let mut earliest: Option<u64> = None;
        let mut consider = |deadline: u64| {
            earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
        };
        if let Some(nanos) = self.expiration.write_nanos() {
            if let Some(slot) = policy.write_order.peek_front() {
                consider(policy.node(slot).write_time().saturating_add(nanos));
            }
        }
        if let Some(nanos) = self.expiration.access_nanos() {
            for deque in [&policy.window, &policy.probation, &policy.protected] {
                if let Some(slot) = deque.peek_front() {
                    let node = &policy.arena.get(slot).expect("stale policy slot").node;
                    consider(node.access_time().saturating_add(nanos));
                }
            }
        }
        if self.expiration.has_variable() {
            if let Some(deadline) = policy.wheel.next_expiration(&policy.arena) {
                consider(deadline);
            }
        }

        match earliest {
            Some(deadline) => {
                let delay = deadline.saturating_sub(now);
                let action = self.drain_action();
                let task: Task = Box::new(move || action());
                policy.pacer.schedule(scheduler.as_ref(), task, now, delay);
            }
            None => policy.pacer.cancel(),
        }
    }

    // -- bulk operations --------------------------------------------------

    fn invalidate_all(&self) {
        let mut policy = self.eviction_lock.lock();
        // Discard stale read events, but apply pending writes so removal
        // notifications observe the newest values.
        self.read_buffer.drain_with(|_| {});
        self.drain_write_buffer(&mut policy);

        let now = self.now();
        for node in self.data.nodes() {
            self.evict_entry(&mut policy, &node, RemovalCause::Explicit, now);
        }
        policy.pacer.cancel();
    }

    fn set_maximum(&self, maximum: u64) {
        if !self.evicts {
            return;
        }
        let mut policy = self.eviction_lock.lock();
        policy.set_maximum(maximum);
        if policy.admittor.is_warm() {
            let maximum = policy.maximum;
            policy.admittor.ensure_capacity(maximum);
        }
        // Shrinks take effect immediately rather than on the next write.
        self.maintenance(&mut policy, None);
    }

    fn coldest(&self, limit: usize) -> Vec<(K, Arc<V>)> {
        let mut policy = self.eviction_lock.lock();
        self.maintenance(&mut policy, None);
        let mut out = Vec::new();
        'outer: for deque in [&policy.window, &policy.probation, &policy.protected] {
            for (_, entry) in deque.iter(&policy.arena) {
                if out.len() == limit {
                    break 'outer;
                }
                if let Some(value) = entry.node.value() {
                    out.push((entry.node.key().clone(), value));
                }
            }
        }
        out
    }

    fn coldest_weighted(&self, max_weight: u64) -> Vec<(K, Arc<V>)> {
        let mut policy = self.eviction_lock.lock();
        self.maintenance(&mut policy, None);
        let mut out = Vec::new();
        let mut budget = max_weight;
        'outer: for deque in [&policy.window, &policy.probation, &policy.protected] {
            for (_, entry) in deque.iter(&policy.arena) {
                let weight = u64::from(entry.node.policy_weight());
                if weight > budget {
                    break 'outer;
                }
                if let Some(value) = entry.node.value() {
                    budget -= weight;
                    out.push((entry.node.key().clone(), value));
                }
            }
        }
        out
    }

    fn hottest(&self, limit: usize) -> Vec<(K, Arc<V>)> {
        let mut policy = self.eviction_lock.lock();
        self.maintenance(&mut policy, None);
        let mut out = Vec::new();
        'outer: for deque in [&policy.protected, &policy.probation, &policy.window] {
            for (_, entry) in deque.iter_rev(&policy.arena) {
                if out.len() == limit {
                    break 'outer;
                }
                if let Some(value) = entry.node.value() {
                    out.push((entry.node.key().clone(), value));
                }
            }
        }
        out
    }

    fn debug_stats(&self) -> DebugStats {
        let policy = self.eviction_lock.lock();
        DebugStats {
            len: self.data.len(),
            weighted_size: policy.weighted_size,
            read_buffer_reads: self.read_buffer.reads(),
            read_buffer_writes: self.read_buffer.writes(),
            write_buffer_producer_index: self.write_buffer.producer_index(),
            pacer_scheduled: policy.pacer.is_scheduled(),
            pacer_next_fire_time: policy.pacer.next_fire_time(),
        }
    }

    // -- listeners --------------------------------------------------------

    /// Synchronous eviction notification, under the eviction lock. Panics
    /// are logged and swallowed so the drain always completes.
    fn notify_eviction(&self, key: &K, value: Option<Arc<V>>, cause: RemovalCause) {
        if let Some(listener) = &self.eviction_listener {
            if catch_unwind(AssertUnwindSafe(|| listener(key, value, cause))).is_err() {
                warn!("eviction listener panicked; continuing the drain");
            }
        }
    }

    /// Writer-side notifications for a displaced stale mapping: evicted
    /// causes reach both listeners, user-initiated ones only the removal
    /// listener.
    fn notify_displaced(&self, node: &Arc<Node<K, V>>, value: Option<Arc<V>>, cause: RemovalCause) {
        if cause.was_evicted() {
            self.notify_eviction(node.key(), value.clone(), cause);
        }
        self.notify_removal(node, value, cause);
    }

    /// Asynchronous removal notification via the executor; a rejecting
    /// executor degrades to the calling thread so no notification is lost.
    fn notify_removal(&self, node: &Arc<Node<K, V>>, value: Option<Arc<V>>, cause: RemovalCause) {
        let Some(listener) = &self.removal_listener else {
            return;
        };
        let listener = Arc::clone(listener);
        let node = Arc::clone(node);
        let action: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let value = value.clone();
            if catch_unwind(AssertUnwindSafe(|| listener(node.key(), value, cause))).is_err() {
                warn!("removal listener panicked");
            }
        });
        let task: Task = {
            let action = Arc::clone(&action);
            Box::new(move || action())
        };
        if self.executor.execute(task).is_err() {
            action();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CacheBuilder;
    use crate::traits::{DirectExecutor, FakeTicker};
    use parking_lot::Mutex as PlMutex;

    fn bounded(maximum: u64) -> BoundedCache<u32, u32> {
        CacheBuilder::new()
            .maximum_size(maximum)
            .executor(Arc::new(DirectExecutor))
            .build()
    }

    /// Forces the frequency sketch warm so admission decisions apply from
    /// the first insertion, as the ordering walks assume.
    fn warm_sketch(cache: &BoundedCache<u32, u32>, maximum: u64) {
        let inner = cache.inner();
        let mut policy = inner.eviction_lock.lock();
        policy.admittor.ensure_capacity(maximum);
        inner.policy_warm.store(true, Ordering::Release);
    }

    fn coldest_keys(cache: &BoundedCache<u32, u32>) -> Vec<u32> {
        cache.coldest(usize::MAX).into_iter().map(|(k, _)| k).collect()
    }

    // ==============================================
    // Drain-Status State Machine
    // ==============================================

    mod drain_status {
        use super::*;

        #[test]
        fn after_write_transitions() {
            let cache = bounded(10);
            let inner = cache.inner();
            let transitions = [
                (IDLE, REQUIRED, true),
                (REQUIRED, REQUIRED, true),
                (PROCESSING_TO_IDLE, PROCESSING_TO_REQUIRED, false),
                (PROCESSING_TO_REQUIRED, PROCESSING_TO_REQUIRED, false),
            ];
            for (start, end, submits) in transitions {
                inner.drain_status.store(start, Ordering::SeqCst);
                assert_eq!(inner.advance_status_after_write(), submits, "from {start}");
                assert_eq!(inner.drain_status(), end, "from {start}");
            }
        }

        #[test]
        fn schedule_drain_transitions() {
            use crate::traits::{Executor, Task, TaskRejected};
            use std::sync::atomic::AtomicUsize;

            /// Swallows tasks so the processing state is observable.
            #[derive(Default)]
            struct SwallowingExecutor {
                submissions: AtomicUsize,
            }
            impl Executor for SwallowingExecutor {
                fn execute(&self, _task: Task) -> Result<(), TaskRejected> {
                    self.submissions.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }

            let executor = Arc::new(SwallowingExecutor::default());
            let cache: BoundedCache<u32, u32> = CacheBuilder::new()
                .maximum_size(10)
                .executor(Arc::clone(&executor) as Arc<dyn Executor>)
                .build();
            let inner = cache.inner();

            let transitions = [
                (IDLE, PROCESSING_TO_IDLE, 1),
                (REQUIRED, PROCESSING_TO_IDLE, 1),
                (PROCESSING_TO_IDLE, PROCESSING_TO_IDLE, 0),
                (PROCESSING_TO_REQUIRED, PROCESSING_TO_REQUIRED, 0),
            ];
            for (start, end, submissions) in transitions {
                executor.submissions.store(0, Ordering::SeqCst);
                inner.drain_status.store(start, Ordering::SeqCst);
                inner.schedule_drain_buffers();
                assert_eq!(inner.drain_status(), end, "from {start}");
                assert_eq!(
                    executor.submissions.load(Ordering::SeqCst),
                    submissions,
                    "submissions from {start}"
                );
            }
        }

        #[test]
        fn drain_completion_returns_to_idle() {
            let cache = bounded(10);
            cache.put(1, 1);
            cache.clean_up();
            assert_eq!(cache.inner().drain_status(), IDLE);
        }
    }

    // ==============================================
    // W-TinyLFU Ordering
    // ==============================================

    mod wtinylfu {
        use super::*;

        fn check_reorder(cache: &BoundedCache<u32, u32>, keys: &[u32], expect: &[u32]) {
            for key in keys {
                cache.get(key);
            }
            cache.clean_up();
            assert_eq!(coldest_keys(cache), expect);
        }

        fn check_evict(cache: &BoundedCache<u32, u32>, keys: &[u32], expect: &[u32]) {
            for &key in keys {
                cache.put(key, key);
            }
            assert_eq!(coldest_keys(cache), expect);
        }

        #[test]
        fn eviction_order_walk() {
            let evictions = Arc::new(PlMutex::new(Vec::new()));
            let seen = Arc::clone(&evictions);
            let cache: BoundedCache<u32, u32> = CacheBuilder::new()
                .maximum_size(10)
                .executor(Arc::new(DirectExecutor))
                .eviction_listener(Arc::new(move |key: &u32, _v, cause| {
                    seen.lock().push((*key, cause));
                }))
                .build();
            warm_sketch(&cache, 10);

            for i in 0..10 {
                cache.put(i, i);
            }
            assert_eq!(coldest_keys(&cache), vec![9, 0, 1, 2, 3, 4, 5, 6, 7, 8]);

            check_reorder(&cache, &[0, 1, 2], &[9, 3, 4, 5, 6, 7, 8, 0, 1, 2]);
            check_evict(&cache, &[10, 11, 12], &[12, 3, 4, 5, 6, 7, 8, 0, 1, 2]);
            check_reorder(&cache, &[6, 7, 8], &[12, 3, 4, 5, 0, 1, 2, 6, 7, 8]);
            check_evict(&cache, &[13, 14, 15], &[15, 3, 4, 5, 0, 1, 2, 6, 7, 8]);

            let evicted = evictions.lock();
            assert!(evicted.len() >= 6, "at least six size evictions: {evicted:?}");
            assert!(evicted.iter().all(|(_, cause)| *cause == RemovalCause::Size));
        }

        #[test]
        fn coldest_set_matches_key_set() {
            let cache = bounded(100);
            for i in 0..20 {
                cache.put(i, i);
            }
            let mut coldest = coldest_keys(&cache);
            coldest.sort_unstable();
            assert_eq!(coldest, (0..20).collect::<Vec<_>>());
        }

        #[test]
        fn hottest_is_reverse_of_coldest() {
            let cache = bounded(100);
            for i in 0..10 {
                cache.put(i, i);
            }
            cache.get(&3);
            cache.clean_up();

            let mut coldest = coldest_keys(&cache);
            coldest.reverse();
            let hottest: Vec<u32> = cache
                .hottest(usize::MAX)
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            assert_eq!(hottest, coldest);
        }

        #[test]
        fn weighted_size_restored_after_cleanup() {
            let cache = bounded(10);
            for i in 0..50 {
                cache.put(i, i);
            }
            cache.clean_up();
            assert!(cache.weighted_size() <= 10);
            assert!(cache.len() <= 10);
        }
    }

    // ==============================================
    // Adaptation
    // ==============================================

    mod adaptation {
        use super::*;

        #[test]
        fn improving_sample_grows_the_window() {
            let cache = bounded(100);
            for i in 0..100 {
                cache.put(i, i);
            }
            cache.clean_up();

            let inner = cache.inner();
            let mut policy = inner.eviction_lock.lock();
            let before = policy.window_maximum;
            policy.climber.set_previous_sample_hit_rate(0.10);
            policy.climber.set_sample(900, 100);
            inner.climb(&mut policy);
            assert!(
                policy.window_maximum > before,
                "window grew: {} -> {}",
                before,
                policy.window_maximum
            );
        }

        #[test]
        fn regressing_sample_grows_main() {
            let cache = bounded(100);
            for i in 0..100 {
                cache.put(i, i);
            }
            cache.clean_up();

            let inner = cache.inner();
            // First grow the window so there is something to give back.
            {
                let mut policy = inner.eviction_lock.lock();
                policy.climber.set_previous_sample_hit_rate(0.10);
                policy.climber.set_sample(900, 100);
                inner.climb(&mut policy);
            }
            let mut policy = inner.eviction_lock.lock();
            let before = policy.window_maximum;
            policy.climber.set_previous_sample_hit_rate(0.95);
            policy.climber.set_sample(100, 900);
            inner.climb(&mut policy);
            assert!(
                policy.window_maximum < before,
                "window shrank: {} -> {}",
                before,
                policy.window_maximum
            );
        }
    }

    // ==============================================
    // Resurrection
    // ==============================================

    mod resurrection {
        use super::*;
        use crate::store::node::ReferenceStrength;

        #[test]
        fn compute_resurrects_a_collected_value() {
            let notifications = Arc::new(PlMutex::new(Vec::new()));
            let seen = Arc::clone(&notifications);
            let cache: BoundedCache<u32, u32> = CacheBuilder::new()
                .maximum_size(10)
                .executor(Arc::new(DirectExecutor))
                .value_reference(ReferenceStrength::Weak)
                .removal_listener(Arc::new(move |key: &u32, value, cause| {
                    seen.lock().push((*key, value.map(|v: Arc<u32>| *v), cause));
                }))
                .build();

            let handle = Arc::new(2u32);
            cache.put_arc(1, Arc::clone(&handle));
            drop(handle); // the only strong reference: the value collects

            assert_eq!(cache.get(&1), None, "collected value reads as absent");

            // Resurrect while the drain races to evict.
            let value = cache.compute(1, |_, current| {
                assert_eq!(current, None);
                Some(3)
            });
            assert_eq!(value.as_deref(), Some(&3));
            cache.clean_up();
            assert_eq!(cache.get(&1).as_deref(), Some(&3), "resurrected value");

            let collected: Vec<_> = notifications
                .lock()
                .iter()
                .filter(|(_, _, cause)| *cause == RemovalCause::Collected)
                .cloned()
                .collect();
            assert_eq!(collected, vec![(1, None, RemovalCause::Collected)]);
        }

        #[test]
        fn collected_value_is_evicted_by_the_drain() {
            let notifications = Arc::new(PlMutex::new(Vec::new()));
            let seen = Arc::clone(&notifications);
            let cache: BoundedCache<u32, u32> = CacheBuilder::new()
                .maximum_size(10)
                .executor(Arc::new(DirectExecutor))
                .value_reference(ReferenceStrength::Weak)
                .removal_listener(Arc::new(move |key: &u32, value, cause| {
                    seen.lock().push((*key, value.map(|v: Arc<u32>| *v), cause));
                }))
                .build();

            let handle = Arc::new(2u32);
            cache.put_arc(1, Arc::clone(&handle));
            cache.clean_up();
            drop(handle);

            // The read observes collection and requests a drain; run one.
            assert_eq!(cache.get(&1), None);
            cache.clean_up();

            assert_eq!(cache.len(), 0);
            let causes: Vec<_> = notifications.lock().iter().map(|n| n.2).collect();
            assert_eq!(causes, vec![RemovalCause::Collected]);
        }
    }

    // ==============================================
    // Expiration Plumbing
    // ==============================================

    mod expiration {
        use super::*;

        #[test]
        fn expired_entry_reads_as_absent_and_is_reclaimed() {
            let ticker = Arc::new(FakeTicker::new());
            let cache: BoundedCache<u32, u32> = CacheBuilder::new()
                .maximum_size(10)
                .executor(Arc::new(DirectExecutor))
                .ticker(Arc::clone(&ticker) as Arc<dyn Ticker>)
                .expire_after_write(Duration::from_secs(60))
                .build();

            cache.put(1, 1);
            assert_eq!(cache.get(&1).as_deref(), Some(&1));

            ticker.advance(61 * 1_000_000_000);
            assert_eq!(cache.get(&1), None);
            cache.clean_up();
            assert_eq!(cache.len(), 0);
        }

        #[test]
        fn access_expiry_is_refreshed_by_reads() {
            let ticker = Arc::new(FakeTicker::new());
            let cache: BoundedCache<u32, u32> = CacheBuilder::new()
                .maximum_size(10)
                .executor(Arc::new(DirectExecutor))
                .ticker(Arc::clone(&ticker) as Arc<dyn Ticker>)
                .expire_after_access(Duration::from_secs(60))
                .build();

            cache.put(1, 1);
            ticker.advance(30 * 1_000_000_000);
            assert_eq!(cache.get(&1).as_deref(), Some(&1));
            ticker.advance(45 * 1_000_000_000);
            // 75s since write, 45s since read: still alive.
            assert_eq!(cache.get(&1).as_deref(), Some(&1));

            ticker.advance(61 * 1_000_000_000);
            assert_eq!(cache.get(&1), None);
        }
    }
}
