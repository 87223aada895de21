//! The cache entry node and its lifecycle.
//!
//! A node is shared between the data map, the hot paths, and the policy
//! heap, so its fields split into three synchronization domains:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           Node<K, V>                                  │
//! │                                                                       │
//! │  immutable:        key, key_hash                                      │
//! │                                                                       │
//! │  node monitor:     value reference, weight, lifecycle transitions     │
//! │  (cell mutex)      out of ALIVE; the "double check under node lock"   │
//! │                    every eviction path must take                      │
//! │                                                                       │
//! │  atomics:          access/write/variable timestamps (hot paths),      │
//! │                    region tag, policy weight, arena slot              │
//! │                    (drain-owned, written under the eviction lock)     │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! `ALIVE → RETIRED → DEAD`, forward only. A node is in the data map iff it
//! is alive. RETIRED means logically removed but still linked in the policy
//! deques until the drain reclaims it; DEAD means fully unlinked. Readers
//! observe the state with acquire loads and treat anything non-alive as
//! absent.
//!
//! ## Value references
//!
//! A value is held either strongly (`Arc<V>`) or weakly (`Weak<V>`). A weak
//! reference whose last strong handle dropped reads as `None`: the entry is
//! *collected*, surfaces as absent, and the next maintenance pass evicts it,
//! unless a concurrent write resurrects it first by installing a fresh
//! value under the node monitor.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::ds::deque::SlotId;

/// Sentinel for "not linked into the policy arena".
const NO_SLOT: usize = usize::MAX;

/// Deadline value meaning "no variable expiration".
pub const NO_DEADLINE: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Node lifecycle states; transitions are forward-only.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// In the data map and eligible for policy bookkeeping.
    Alive = 0,
    /// Logically removed; awaiting drain reclamation.
    Retired = 1,
    /// Fully unlinked from map and policy state.
    Dead = 2,
}

impl From<u8> for Lifecycle {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Alive,
            1 => Lifecycle::Retired,
            2 => Lifecycle::Dead,
            _ => unreachable!("only values 0-2 are supported"),
        }
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// Which access-ordered region currently holds the node.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Region {
    /// Admission window: every new entry starts here.
    Window = 0,
    /// Main region, unproven entries; eviction victims come from its front.
    MainProbation = 1,
    /// Main region, entries re-accessed while on probation.
    MainProtected = 2,
}

impl From<u8> for Region {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Region::Window,
            1 => Region::MainProbation,
            2 => Region::MainProtected,
            _ => unreachable!("only values 0-2 are supported"),
        }
    }
}

// ---------------------------------------------------------------------------
// Value references
// ---------------------------------------------------------------------------

/// How the cache holds values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ReferenceStrength {
    /// The cache keeps values alive.
    #[default]
    Strong,
    /// The cache holds a weak reference; values live only while callers hold
    /// the `Arc`, and a collected value is evicted on the next drain.
    Weak,
}

/// A strongly or weakly held value.
#[derive(Debug)]
pub enum ValueRef<V> {
    Strong(Arc<V>),
    Weak(Weak<V>),
}

impl<V> ValueRef<V> {
    /// Wraps `value` with the requested strength.
    pub fn new(value: Arc<V>, strength: ReferenceStrength) -> Self {
        match strength {
            ReferenceStrength::Strong => ValueRef::Strong(value),
            ReferenceStrength::Weak => ValueRef::Weak(Arc::downgrade(&value)),
        }
    }

    /// Returns the value if it is still live.
    pub fn get(&self) -> Option<Arc<V>> {
        match self {
            ValueRef::Strong(value) => Some(Arc::clone(value)),
            ValueRef::Weak(value) => value.upgrade(),
        }
    }
}

/// Monitor-guarded portion of a node: the value and its weight.
#[derive(Debug)]
pub struct ValueCell<V> {
    value: ValueRef<V>,
    weight: u32,
}

impl<V> ValueCell<V> {
    /// Returns the value if it is still live; `None` means collected.
    #[inline]
    pub fn value(&self) -> Option<Arc<V>> {
        self.value.get()
    }

    /// Returns `true` if a weak value has been collected.
    #[inline]
    pub fn is_collected(&self) -> bool {
        self.value().is_none()
    }

    /// The weight recorded at the last write.
    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Installs a new value and weight.
    #[inline]
    pub fn set(&mut self, value: Arc<V>, strength: ReferenceStrength, weight: u32) {
        self.value = ValueRef::new(value, strength);
        self.weight = weight;
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A cache entry shared by the data map, hot paths, and policy heap.
#[derive(Debug)]
pub struct Node<K, V> {
    key: K,
    key_hash: u64,
    cell: Mutex<ValueCell<V>>,
    state: AtomicU8,
    region: AtomicU8,
    policy_weight: AtomicU32,
    slot: AtomicUsize,
    access_time: AtomicU64,
    write_time: AtomicU64,
    variable_time: AtomicU64,
}

impl<K, V> Node<K, V> {
    /// Creates an alive node positioned in the window.
    pub fn new(
        key: K,
        key_hash: u64,
        value: Arc<V>,
        strength: ReferenceStrength,
        weight: u32,
        now: u64,
    ) -> Self {
        Self {
            key,
            key_hash,
            cell: Mutex::new(ValueCell {
                value: ValueRef::new(value, strength),
                weight,
            }),
            state: AtomicU8::new(Lifecycle::Alive as u8),
            region: AtomicU8::new(Region::Window as u8),
            policy_weight: AtomicU32::new(0),
            slot: AtomicUsize::new(NO_SLOT),
            access_time: AtomicU64::new(now),
            write_time: AtomicU64::new(now),
            variable_time: AtomicU64::new(NO_DEADLINE),
        }
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }

    /// Acquires the node monitor.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ValueCell<V>> {
        self.cell.lock()
    }

    /// Reads the value without policy side effects.
    #[inline]
    pub fn value(&self) -> Option<Arc<V>> {
        self.cell.lock().value()
    }

    // -- lifecycle --------------------------------------------------------

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.lifecycle() == Lifecycle::Alive
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.lifecycle() == Lifecycle::Retired
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.lifecycle() == Lifecycle::Dead
    }

    /// Transitions ALIVE → RETIRED. Must hold the node monitor.
    #[inline]
    pub fn retire(&self) {
        debug_assert!(self.is_alive(), "retire from {:?}", self.lifecycle());
        self.state.store(Lifecycle::Retired as u8, Ordering::Release);
    }

    /// Transitions RETIRED → DEAD. Must hold the eviction lock.
    #[inline]
    pub fn die(&self) {
        debug_assert!(!self.is_dead(), "die called twice");
        self.state.store(Lifecycle::Dead as u8, Ordering::Release);
    }

    // -- region and policy links ------------------------------------------

    #[inline]
    pub fn region(&self) -> Region {
        Region::from(self.region.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_region(&self, region: Region) {
        self.region.store(region as u8, Ordering::Relaxed);
    }

    /// The policy arena slot, while linked.
    #[inline]
    pub fn slot(&self) -> Option<SlotId> {
        match self.slot.load(Ordering::Relaxed) {
            NO_SLOT => None,
            index => Some(SlotId(index)),
        }
    }

    #[inline]
    pub fn set_slot(&self, slot: Option<SlotId>) {
        self.slot
            .store(slot.map_or(NO_SLOT, |id| id.index()), Ordering::Relaxed);
    }

    /// The weight currently accounted by the policy (may lag the cell's
    /// weight until the update task drains).
    #[inline]
    pub fn policy_weight(&self) -> u32 {
        self.policy_weight.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_policy_weight(&self, weight: u32) {
        self.policy_weight.store(weight, Ordering::Relaxed);
    }

    // -- timestamps -------------------------------------------------------

    #[inline]
    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_access_time(&self, nanos: u64) {
        self.access_time.store(nanos, Ordering::Relaxed);
    }

    #[inline]
    pub fn write_time(&self) -> u64 {
        self.write_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_write_time(&self, nanos: u64) {
        self.write_time.store(nanos, Ordering::Relaxed);
    }

    /// Absolute variable-expiry deadline; [`NO_DEADLINE`] when unused.
    #[inline]
    pub fn variable_time(&self) -> u64 {
        self.variable_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_variable_time(&self, nanos: u64) {
        self.variable_time.store(nanos, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
