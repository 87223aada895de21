// ==============================================
// ENGINE OPERATION TESTS (integration)
// ==============================================
//
// Cross-module scenarios exercising the public surface: ordering through the
// admission pipeline, write-tolerance coalescing, executor-rejection
// degradation, oversized updates, and pacer lifecycle. Structural unit tests
// live next to their modules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use windcache::prelude::*;
use windcache::traits::{CancelFlag, RejectingExecutor};

const SECOND: u64 = 1_000_000_000;

/// Scheduler that records requested delays and hands out cancel flags.
#[derive(Default)]
struct RecordingScheduler {
    delays: Mutex<Vec<u64>>,
    handles: Mutex<Vec<Arc<CancelFlag>>>,
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, delay_nanos: u64, _task: Task) -> Arc<dyn ScheduledTask> {
        self.delays.lock().push(delay_nanos);
        let handle = Arc::new(CancelFlag::new());
        self.handles.lock().push(Arc::clone(&handle));
        handle
    }
}

/// Expiry returning a settable fixed lifetime for every event.
struct SettableExpiry {
    nanos: AtomicU64,
}

impl SettableExpiry {
    fn new(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }
}

/// Newtype around `Arc<SettableExpiry>` so the `Expiry` impl below satisfies
/// the orphan rule (both `Arc` and `Expiry` are foreign to this test crate).
struct SettableExpiryHandle(Arc<SettableExpiry>);

impl Expiry<u32, u32> for SettableExpiryHandle {
    fn expire_after_create(&self, _: &u32, _: &u32, _: u64) -> u64 {
        self.0.nanos.load(Ordering::SeqCst)
    }
    fn expire_after_update(&self, _: &u32, _: &u32, _: u64, _: u64) -> u64 {
        self.0.nanos.load(Ordering::SeqCst)
    }
    fn expire_after_read(&self, _: &u32, _: &u32, _: u64, current: u64) -> u64 {
        current
    }
}

// ==============================================
// Round Trips
// ==============================================

mod round_trips {
    use super::*;

    #[test]
    fn put_then_get_returns_the_value() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        assert_eq!(cache.put(1, 10), None);
        assert_eq!(cache.get(&1).as_deref(), Some(&10));
    }

    #[test]
    fn put_then_remove_then_get() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        cache.put(1, 10);
        assert_eq!(cache.remove(&1).as_deref(), Some(&10));
        assert_eq!(cache.get(&1), None);
        cache.clean_up();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn put_returns_previous_value() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        cache.put(1, 10);
        assert_eq!(cache.put(1, 20).as_deref(), Some(&10));
        assert_eq!(cache.get(&1).as_deref(), Some(&20));
    }

    #[test]
    fn put_if_absent_keeps_the_existing_value() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        assert_eq!(cache.put_if_absent(1, 10), None);
        assert_eq!(cache.put_if_absent(1, 20).as_deref(), Some(&10));
        assert_eq!(cache.get(&1).as_deref(), Some(&10));
    }

    #[test]
    fn replace_requires_presence() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        assert_eq!(cache.replace(&1, 10), None);
        cache.put(1, 10);
        assert_eq!(cache.replace(&1, 20).as_deref(), Some(&10));
        assert_eq!(cache.get(&1).as_deref(), Some(&20));
    }

    #[test]
    fn conditional_replace_and_remove_compare_values() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        cache.put(1, 10);

        assert!(!cache.replace_if(&1, &99, 20), "mismatch leaves value");
        assert_eq!(cache.get(&1).as_deref(), Some(&10));
        assert!(cache.replace_if(&1, &10, 20));
        assert_eq!(cache.get(&1).as_deref(), Some(&20));

        assert!(!cache.remove_if(&1, &10), "mismatch leaves entry");
        assert!(cache.remove_if(&1, &20));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn coldest_weighted_respects_the_budget() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new()
            .maximum_weight(100)
            .weigher(|_k: &u32, v: &u32| *v)
            .build();
        for i in 1..=5 {
            cache.put(i, 10);
        }
        let slice = cache.coldest_weighted(25);
        assert_eq!(slice.len(), 2, "two ten-weight entries fit in 25");
    }

    #[test]
    fn compute_inserts_updates_and_removes() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();

        assert_eq!(cache.compute(1, |_, v| Some(v.map_or(1, |v| *v + 1))).as_deref(), Some(&1));
        assert_eq!(cache.compute(1, |_, v| Some(v.map_or(1, |v| *v + 1))).as_deref(), Some(&2));
        assert_eq!(cache.compute(1, |_, _| None), None);
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn compute_if_absent_initializes_once() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        assert_eq!(*cache.compute_if_absent(1, |_| 10), 10);
        assert_eq!(*cache.compute_if_absent(1, |_| 99), 10);
    }

    #[test]
    fn compute_if_present_skips_absent_keys() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        assert_eq!(cache.compute_if_present(&1, |_, _| Some(9)), None);
        cache.put(1, 1);
        assert_eq!(cache.compute_if_present(&1, |_, v| Some(*v + 1)).as_deref(), Some(&2));
    }

    #[test]
    fn merge_combines_values() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        assert_eq!(*cache.merge(1, 5, |old, new| *old + new), 5);
        assert_eq!(*cache.merge(1, 7, |old, new| *old + new), 12);
    }

    #[test]
    fn invalidate_all_empties_the_cache() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        for i in 0..10 {
            cache.put(i, i);
        }
        cache.invalidate_all();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.weighted_size(), 0);
    }
}

// ==============================================
// Quiescent Properties
// ==============================================

mod quiescence {
    use super::*;

    #[test]
    fn read_buffer_fully_drained_after_cleanup() {
        // Access expiration forces reads through the buffer.
        let cache: BoundedCache<u32, u32> = CacheBuilder::new()
            .maximum_size(100)
            .expire_after_access(Duration::from_secs(3600))
            .build();
        for i in 0..20 {
            cache.put(i, i);
        }
        for _ in 0..3 {
            for i in 0..20 {
                cache.get(&i);
            }
        }
        cache.clean_up();

        let stats = cache.debug_stats();
        assert_eq!(stats.read_buffer_reads, stats.read_buffer_writes);
    }

    #[test]
    fn coldest_enumerates_every_key() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(100).build();
        for i in 0..30 {
            cache.put(i, i);
        }
        let mut keys: Vec<u32> = cache.coldest(usize::MAX).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), cache.len());
        keys.sort_unstable();
        assert_eq!(keys, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn weighted_size_bounded_after_cleanup() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(10).build();
        for i in 0..1_000 {
            cache.put(i, i);
        }
        cache.clean_up();
        assert!(cache.weighted_size() <= 10, "bound restored");
        assert!(cache.len() <= 10);
    }
}

// ==============================================
// Write-Tolerance Coalescing
// ==============================================

mod write_tolerance {
    use super::*;

    #[test]
    fn rapid_rewrites_coalesce_into_reads() {
        let ticker = Arc::new(FakeTicker::new());
        let cache: BoundedCache<u32, u32> = CacheBuilder::new()
            .maximum_size(100)
            .ticker(Arc::clone(&ticker) as Arc<dyn Ticker>)
            .expire_after_write(Duration::from_secs(60))
            .build();

        cache.put(1, 1);
        assert_eq!(cache.debug_stats().write_buffer_producer_index, 1);

        // Within the tolerance the update is buffered as a read.
        cache.put(1, 2);
        assert_eq!(cache.debug_stats().write_buffer_producer_index, 1);
        assert_eq!(cache.get(&1).as_deref(), Some(&2), "value still replaced");

        // Past the tolerance it is a write again.
        ticker.advance(SECOND + 1);
        cache.put(1, 3);
        assert_eq!(cache.debug_stats().write_buffer_producer_index, 2);
    }

    #[test]
    fn variable_expiry_shift_forces_a_write() {
        let ticker = Arc::new(FakeTicker::new());
        let expiry = Arc::new(SettableExpiry::new(60 * SECOND));
        let cache: BoundedCache<u32, u32> = CacheBuilder::new()
            .maximum_size(100)
            .ticker(Arc::clone(&ticker) as Arc<dyn Ticker>)
            .expiry(SettableExpiryHandle(Arc::clone(&expiry)))
            .build();

        cache.put(1, 1);
        assert_eq!(cache.debug_stats().write_buffer_producer_index, 1);

        // Same deadline: coalesced to a read, and the read stays buffered
        // (variable expiration disables the read-buffer skip).
        cache.put(1, 2);
        let stats = cache.debug_stats();
        assert_eq!(stats.write_buffer_producer_index, 1);
        assert_eq!(stats.read_buffer_writes, 1);
        assert_eq!(stats.read_buffer_reads, 0);

        // Deadline drifts past the tolerance: a write again.
        ticker.advance(SECOND + 1);
        cache.put(1, 3);
        assert_eq!(cache.debug_stats().write_buffer_producer_index, 2);

        // Shrinking the lifetime moves the deadline far: write.
        expiry.nanos.store(1_000_000, Ordering::SeqCst);
        cache.put(1, 4);
        assert_eq!(cache.debug_stats().write_buffer_producer_index, 3);

        // Growing it far: write.
        expiry.nanos.store(3_600 * SECOND, Ordering::SeqCst);
        cache.put(1, 5);
        assert_eq!(cache.debug_stats().write_buffer_producer_index, 4);
    }
}

// ==============================================
// Executor Rejection
// ==============================================

mod executor_rejection {
    use super::*;

    #[test]
    fn writes_succeed_with_a_rejecting_executor() {
        let executor = Arc::new(RejectingExecutor::new());
        let cache: BoundedCache<u32, u32> = CacheBuilder::new()
            .maximum_size(10)
            .executor(Arc::clone(&executor) as Arc<dyn Executor>)
            .build();

        for i in 0..50 {
            cache.put(i, i);
        }
        assert!(executor.rejection_count() > 0, "drain submissions rejected");

        // The inline drain kept everything consistent.
        cache.clean_up();
        assert!(cache.weighted_size() <= 10);
        assert!(cache.len() <= 10);
        let stats = cache.debug_stats();
        assert_eq!(stats.weighted_size as usize, stats.len);
    }

    #[test]
    fn removal_notifications_survive_rejection() {
        let removals = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&removals);
        let cache: BoundedCache<u32, u32> = CacheBuilder::new()
            .maximum_size(100)
            .executor(Arc::new(RejectingExecutor::new()) as Arc<dyn Executor>)
            .removal_listener(Arc::new(move |key: &u32, _value, cause| {
                seen.lock().push((*key, cause));
            }))
            .build();

        cache.put(1, 1);
        cache.remove(&1);
        assert_eq!(removals.lock().as_slice(), &[(1, RemovalCause::Explicit)]);
    }
}

// ==============================================
// Oversized Entries
// ==============================================

mod oversize {
    use super::*;

    fn weighted_cache(
        removals: &Arc<Mutex<Vec<(u32, Option<u32>, RemovalCause)>>>,
    ) -> BoundedCache<u32, u32> {
        let seen = Arc::clone(removals);
        CacheBuilder::new()
            .maximum_weight(10)
            .weigher(|_k: &u32, v: &u32| *v)
            .removal_listener(Arc::new(move |key: &u32, value, cause| {
                seen.lock().push((*key, value.map(|v: Arc<u32>| *v), cause));
            }))
            .build()
    }

    #[test]
    fn update_beyond_the_maximum_is_evicted() {
        let removals = Arc::new(Mutex::new(Vec::new()));
        let cache = weighted_cache(&removals);

        cache.put(9, 9);
        cache.put(1, 1);
        cache.clean_up();
        assert_eq!(cache.weighted_size(), 10);

        // The updated entry no longer fits anywhere.
        cache.put(1, 20);
        cache.clean_up();

        assert!(cache.weighted_size() <= 10);
        assert_eq!(cache.get(&1), None);
        let removals = removals.lock();
        assert!(
            removals.contains(&(1, Some(1), RemovalCause::Replaced)),
            "old value replaced: {removals:?}"
        );
        assert!(
            removals.contains(&(1, Some(20), RemovalCause::Size)),
            "new value evicted for size: {removals:?}"
        );
    }

    #[test]
    fn insert_beyond_the_maximum_disappears_atomically() {
        let removals = Arc::new(Mutex::new(Vec::new()));
        let cache = weighted_cache(&removals);

        cache.put(1, 50);
        cache.clean_up();

        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.weighted_size(), 0);
        assert!(removals
            .lock()
            .contains(&(1, Some(50), RemovalCause::Size)));
    }
}

// ==============================================
// Pacer Lifecycle
// ==============================================

mod pacing {
    use super::*;

    fn paced_cache(
        ticker: &Arc<FakeTicker>,
        scheduler: &Arc<RecordingScheduler>,
    ) -> BoundedCache<u32, u32> {
        CacheBuilder::new()
            .maximum_size(100)
            .ticker(Arc::clone(ticker) as Arc<dyn Ticker>)
            .scheduler(Arc::clone(scheduler) as Arc<dyn Scheduler>)
            .expire_after_write(Duration::from_secs(60))
            .build()
    }

    #[test]
    fn writes_arm_the_pacer() {
        let ticker = Arc::new(FakeTicker::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let cache = paced_cache(&ticker, &scheduler);

        for i in 0..10 {
            cache.put(i, i);
        }
        let stats = cache.debug_stats();
        assert!(stats.pacer_scheduled);
        assert_ne!(stats.pacer_next_fire_time, 0);
        assert!(!scheduler.delays.lock().is_empty());
    }

    #[test]
    fn invalidate_all_disarms_the_pacer() {
        let ticker = Arc::new(FakeTicker::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let cache = paced_cache(&ticker, &scheduler);

        for i in 0..10 {
            cache.put(i, i);
        }
        assert!(cache.debug_stats().pacer_scheduled);

        cache.invalidate_all();
        let stats = cache.debug_stats();
        assert!(!stats.pacer_scheduled);
        assert_eq!(stats.pacer_next_fire_time, 0);
        assert_eq!(cache.len(), 0);
        let handles = scheduler.handles.lock();
        assert!(handles.last().unwrap().is_cancelled());
    }

    #[test]
    fn cleanup_after_everything_expired_disarms_the_pacer() {
        let ticker = Arc::new(FakeTicker::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let cache = paced_cache(&ticker, &scheduler);

        for i in 0..10 {
            cache.put(i, i);
        }
        assert!(cache.debug_stats().pacer_scheduled);

        ticker.advance(3_600 * SECOND);
        cache.clean_up();

        let stats = cache.debug_stats();
        assert_eq!(cache.len(), 0, "everything expired");
        assert!(!stats.pacer_scheduled);
        assert_eq!(stats.pacer_next_fire_time, 0);
    }
}

// ==============================================
// Concurrency Smoke
// ==============================================

mod concurrency {
    use super::*;

    #[test]
    fn concurrent_writers_and_readers_stay_consistent() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(64).build();
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                for i in 0..500u32 {
                    let key = (t * 500 + i) % 128;
                    cache.put(key, i);
                    cache.get(&(key / 2));
                    if i % 64 == 0 {
                        cache.remove(&key);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        cache.clean_up();
        assert!(cache.weighted_size() <= 64);
        assert!(cache.len() <= 64 + 1, "at most one oversized transient");
    }

    #[test]
    fn invalidate_all_races_with_writers() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(64).build();
        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..1_000u32 {
                    cache.put(i % 32, i);
                }
            })
        };
        for _ in 0..10 {
            cache.invalidate_all();
        }
        writer.join().unwrap();

        cache.invalidate_all();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.weighted_size(), 0);
    }

    #[test]
    fn same_key_computes_serialize() {
        let cache: BoundedCache<u32, u32> = CacheBuilder::new().maximum_size(16).build();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    cache.compute(7, |_, v| Some(v.map_or(1, |v| *v + 1)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.get(&7).as_deref(), Some(&1_000));
    }
}
