//! Sharded data map and key-stripe lock table.
//!
//! The map is the only structure hot-path readers touch: a fixed array of
//! `RwLock<FxHashMap<K, Arc<Node>>>` shards selected by key hash. Reads take
//! one shard read lock for the duration of a lookup; writers take the shard
//! write lock only around the map mutation itself, never while running user
//! code.
//!
//! ## Architecture
//!
//! ```text
//!   hash(key) ──┬── high bits ──► shard index ──► RwLock<FxHashMap<…>>
//!               │
//!               └── low bits ───► stripe index ─► Mutex<()>  (key stripes)
//!
//!   shards:   guard the key → node association
//!   stripes:  serialize same-key writers across the absent-key window,
//!             where no node monitor exists yet to lock
//! ```
//!
//! Lock order everywhere in the crate: node monitor → shard lock. Stripe
//! locks are only held around compute-style operations, which take them
//! before any node monitor. The maintenance pass never takes a stripe lock,
//! so a writer helping the drain while holding its stripe cannot deadlock.

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::store::node::Node;

/// Number of key stripes; enough to make same-stripe collisions of distinct
/// hot keys unlikely.
const STRIPES: usize = 64;

/// Sharded `key → Arc<Node>` map.
pub struct DataMap<K, V> {
    shards: Box<[RwLock<FxHashMap<K, Arc<Node<K, V>>>>]>,
    stripes: Box<[Mutex<()>]>,
    shard_mask: u64,
}

impl<K, V> std::fmt::Debug for DataMap<K, V>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataMap")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

impl<K, V> DataMap<K, V>
where
    K: Hash + Eq,
{
    /// Creates a map with `shards` shards (rounded up to a power of two) and
    /// a per-shard capacity hint derived from `initial_capacity`.
    pub fn new(shards: usize, initial_capacity: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        let per_shard = initial_capacity / shards;
        let shard_vec: Vec<_> = (0..shards)
            .map(|_| {
                RwLock::new(FxHashMap::with_capacity_and_hasher(
                    per_shard,
                    Default::default(),
                ))
            })
            .collect();
        let stripe_vec: Vec<_> = (0..STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            shards: shard_vec.into_boxed_slice(),
            stripes: stripe_vec.into_boxed_slice(),
            shard_mask: (shards - 1) as u64,
        }
    }

    /// Hashes a key with the map's hasher.
    #[inline]
    pub fn hash(&self, key: &K) -> u64 {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[inline]
    fn shard(&self, hash: u64) -> &RwLock<FxHashMap<K, Arc<Node<K, V>>>> {
        // High bits: FxHash mixes them better than the low ones.
        &self.shards[((hash >> 32) & self.shard_mask) as usize]
    }

    /// Locks the key stripe for `hash`, serializing same-key writers.
    #[inline]
    pub fn key_stripe(&self, hash: u64) -> MutexGuard<'_, ()> {
        self.stripes[(hash as usize) & (STRIPES - 1)].lock()
    }

    /// Looks up the node for `key`.
    pub fn get(&self, key: &K, hash: u64) -> Option<Arc<Node<K, V>>> {
        self.shard(hash).read().get(key).map(Arc::clone)
    }

    /// Returns `true` if `key` maps to a live node.
    pub fn contains(&self, key: &K, hash: u64) -> bool {
        self.shard(hash)
            .read()
            .get(key)
            .map(|node| node.is_alive())
            .unwrap_or(false)
    }

    /// Inserts a node, returning the displaced one if any.
    pub fn insert(&self, key: K, hash: u64, node: Arc<Node<K, V>>) -> Option<Arc<Node<K, V>>> {
        self.shard(hash).write().insert(key, node)
    }

    /// Inserts only if `key` is vacant; returns the occupant otherwise.
    pub fn try_insert(
        &self,
        key: K,
        hash: u64,
        node: Arc<Node<K, V>>,
    ) -> Result<(), Arc<Node<K, V>>> {
        use std::collections::hash_map::Entry;
        let mut shard = self.shard(hash).write();
        match shard.entry(key) {
            Entry::Occupied(entry) => Err(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(node);
                Ok(())
            }
        }
    }

    /// Removes whatever node `key` maps to.
    pub fn remove(&self, key: &K, hash: u64) -> Option<Arc<Node<K, V>>> {
        self.shard(hash).write().remove(key)
    }

    /// Removes the mapping only if it still points at `node`.
    ///
    /// Guards eviction against racing a writer that already replaced the
    /// mapping with a fresh node for the same key.
    pub fn remove_if_same(&self, key: &K, hash: u64, node: &Arc<Node<K, V>>) -> bool {
        let mut shard = self.shard(hash).write();
        match shard.get(key) {
            Some(current) if Arc::ptr_eq(current, node) => {
                shard.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Total number of mapped nodes.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Returns `true` if no nodes are mapped.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Snapshots every mapped node.
    pub fn nodes(&self) -> Vec<Arc<Node<K, V>>> {
        let mut nodes = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            nodes.extend(shard.read().values().cloned());
        }
        nodes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::node::ReferenceStrength;

    fn new_node(map: &DataMap<u32, u32>, key: u32, value: u32) -> Arc<Node<u32, u32>> {
        let hash = map.hash(&key);
        Arc::new(Node::new(
            key,
            hash,
            Arc::new(value),
            ReferenceStrength::Strong,
            1,
            0,
        ))
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let map: DataMap<u32, u32> = DataMap::new(4, 16);
        let node = new_node(&map, 1, 10);
        let hash = map.hash(&1);

        assert!(map.insert(1, hash, Arc::clone(&node)).is_none());
        assert!(Arc::ptr_eq(&map.get(&1, hash).unwrap(), &node));
        assert_eq!(map.len(), 1);

        assert!(map.remove(&1, hash).is_some());
        assert!(map.get(&1, hash).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn remove_if_same_respects_replacement() {
        let map: DataMap<u32, u32> = DataMap::new(4, 16);
        let hash = map.hash(&1);
        let original = new_node(&map, 1, 10);
        let replacement = new_node(&map, 1, 20);

        map.insert(1, hash, Arc::clone(&original));
        map.insert(1, hash, Arc::clone(&replacement));

        assert!(!map.remove_if_same(&1, hash, &original), "stale node");
        assert!(map.get(&1, hash).is_some());

        assert!(map.remove_if_same(&1, hash, &replacement));
        assert!(map.get(&1, hash).is_none());
    }

    #[test]
    fn nodes_snapshot_covers_all_shards() {
        let map: DataMap<u32, u32> = DataMap::new(8, 16);
        for key in 0..32 {
            let node = new_node(&map, key, key);
            map.insert(key, map.hash(&key), node);
        }

        let mut keys: Vec<u32> = map.nodes().iter().map(|n| *n.key()).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn shard_count_rounds_up() {
        let map: DataMap<u32, u32> = DataMap::new(3, 0);
        assert_eq!(map.shards.len(), 4);
    }

    #[test]
    fn stripe_lock_is_exclusive_per_stripe() {
        let map: DataMap<u32, u32> = DataMap::new(4, 16);
        let hash = map.hash(&1);
        let guard = map.key_stripe(hash);
        // A different stripe is still available.
        let other = map.key_stripe(hash.wrapping_add(1));
        drop(other);
        drop(guard);
    }
}
