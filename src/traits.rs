//! # Collaborator Seams
//!
//! This module defines the traits through which the cache engine talks to the
//! outside world: time, weighing, per-entry expiration, task execution, and
//! delayed scheduling. The engine never calls `std::time` or spawns threads
//! directly; every environmental dependency flows through one of these seams
//! so tests can substitute deterministic implementations.
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────────────────────────────────────────────────────────┐
//!   │                       BoundedCache engine                      │
//!   │                                                                │
//!   │   time ────────► Ticker::read() -> u64 ns (monotonic)          │
//!   │   entry size ──► Weigher::weigh(&K, &V) -> u32                 │
//!   │   per-entry ttl► Expiry::expire_after_{create,update,read}     │
//!   │   async drain ─► Executor::execute(task) -> Result             │
//!   │   delayed run ─► Scheduler::schedule(delay, task) -> handle    │
//!   │   evictions ───► EvictionListener (sync, under eviction lock)  │
//!   │                  RemovalListener (async, via the executor)     │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`Ticker`]: monotonic nanosecond clock; [`SystemTicker`] for production,
//!   [`FakeTicker`] for deterministic tests.
//! - [`Weigher`]: maps an entry to a non-negative weight. Implemented for any
//!   `Fn(&K, &V) -> u32`.
//! - [`Expiry`]: variable per-entry expiration, queried on create/update/read.
//! - [`Executor`]: runs the maintenance task; may reject, in which case the
//!   caller degrades to a synchronous drain.
//! - [`Scheduler`] / [`ScheduledTask`]: cancelable delayed execution used by
//!   the cleanup pacer.
//! - [`RemovalCause`]: why an entry left the cache.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A boxed unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// RemovalCause
// ---------------------------------------------------------------------------

/// The reason an entry was removed from the cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RemovalCause {
    /// The entry was manually removed by the user.
    Explicit,
    /// The entry's value was replaced by the user.
    Replaced,
    /// The entry's value reference was cleared by the collector.
    Collected,
    /// The entry's expiration deadline passed.
    Expired,
    /// The entry was evicted to satisfy the capacity bound.
    Size,
}

impl RemovalCause {
    /// Returns `true` if the removal was decided by the cache rather than
    /// requested by the user.
    #[inline]
    pub fn was_evicted(self) -> bool {
        matches!(
            self,
            RemovalCause::Collected | RemovalCause::Expired | RemovalCause::Size
        )
    }
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemovalCause::Explicit => "explicit",
            RemovalCause::Replaced => "replaced",
            RemovalCause::Collected => "collected",
            RemovalCause::Expired => "expired",
            RemovalCause::Size => "size",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Listener invoked when the cache evicts or removes an entry.
///
/// The value is `None` when the entry's reference had already been collected.
/// Two dispatch points exist: the eviction listener runs synchronously under
/// the eviction lock, the removal listener runs asynchronously on the
/// configured [`Executor`].
pub type Listener<K, V> = Arc<dyn Fn(&K, Option<Arc<V>>, RemovalCause) + Send + Sync>;

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// A monotonic nanosecond time source.
///
/// All engine timestamps (access, write, variable expiration) are read from a
/// ticker, never from the system clock, so time can be advanced synthetically
/// in tests.
pub trait Ticker: Send + Sync {
    /// Returns the current reading in nanoseconds from an arbitrary origin.
    fn read(&self) -> u64;
}

/// Production ticker backed by [`Instant`].
///
/// Readings are nanoseconds elapsed since the ticker was created.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    /// Creates a ticker anchored at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    #[inline]
    fn read(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced ticker for deterministic tests.
///
/// # Example
///
/// ```
/// use windcache::traits::{FakeTicker, Ticker};
///
/// let ticker = FakeTicker::new();
/// assert_eq!(ticker.read(), 0);
///
/// ticker.advance(1_000);
/// assert_eq!(ticker.read(), 1_000);
/// ```
#[derive(Debug, Default)]
pub struct FakeTicker {
    nanos: AtomicU64,
}

impl FakeTicker {
    /// Creates a ticker reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the reading by `nanos` nanoseconds.
    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Ticker for FakeTicker {
    #[inline]
    fn read(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Weigher
// ---------------------------------------------------------------------------

/// Computes the weight of an entry at insertion and update time.
///
/// Weights are non-negative and never recomputed on read; the engine caches
/// the weight alongside the entry. A weight of zero marks the entry as
/// ineligible for size-based eviction.
pub trait Weigher<K, V>: Send + Sync {
    /// Returns the weight of the given entry.
    fn weigh(&self, key: &K, value: &V) -> u32;
}

impl<K, V, F> Weigher<K, V> for F
where
    F: Fn(&K, &V) -> u32 + Send + Sync,
{
    #[inline]
    fn weigh(&self, key: &K, value: &V) -> u32 {
        self(key, value)
    }
}

/// The default weigher: every entry weighs one, making the maximum an
/// entry-count bound.
pub fn unit_weigher<K, V>(_key: &K, _value: &V) -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

/// Variable per-entry expiration policy.
///
/// Each hook returns the remaining lifetime in nanoseconds, measured from
/// `now`. `current` is the previously remaining lifetime. Returning
/// `u64::MAX` effectively disables expiration for the entry.
pub trait Expiry<K, V>: Send + Sync {
    /// Lifetime for a newly created entry.
    fn expire_after_create(&self, key: &K, value: &V, now: u64) -> u64;

    /// Lifetime after the entry's value was replaced. Defaults to keeping the
    /// current remaining lifetime.
    fn expire_after_update(&self, key: &K, value: &V, now: u64, current: u64) -> u64 {
        let _ = (key, value, now);
        current
    }

    /// Lifetime after the entry was read. Defaults to keeping the current
    /// remaining lifetime.
    fn expire_after_read(&self, key: &K, value: &V, now: u64, current: u64) -> u64 {
        let _ = (key, value, now);
        current
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Error returned when an [`Executor`] declines a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRejected;

impl fmt::Display for TaskRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("task rejected by executor")
    }
}

impl std::error::Error for TaskRejected {}

/// Runs deferred work, typically the buffer-drain task and asynchronous
/// removal notifications.
///
/// An executor may reject a task; the engine then runs the work synchronously
/// on the calling thread, so rejection never loses state.
pub trait Executor: Send + Sync {
    /// Submits a task for execution.
    fn execute(&self, task: Task) -> Result<(), TaskRejected>;
}

/// Executor that runs every task inline on the calling thread.
///
/// This is the default: the maintenance pass is cheap and amortized, so most
/// deployments do not need a thread pool behind the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    #[inline]
    fn execute(&self, task: Task) -> Result<(), TaskRejected> {
        task();
        Ok(())
    }
}

/// Executor that rejects every task, for exercising the synchronous-drain
/// degradation path.
#[derive(Debug, Default)]
pub struct RejectingExecutor {
    rejections: AtomicU64,
}

impl RejectingExecutor {
    /// Creates a rejecting executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many tasks have been rejected.
    pub fn rejection_count(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

impl Executor for RejectingExecutor {
    fn execute(&self, _task: Task) -> Result<(), TaskRejected> {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        Err(TaskRejected)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Handle to a task scheduled for delayed execution.
pub trait ScheduledTask: Send + Sync {
    /// Requests cancellation. Cancelling an already-fired task is a no-op.
    fn cancel(&self);

    /// Returns `true` if the task was cancelled before firing.
    fn is_cancelled(&self) -> bool;
}

/// Schedules a task to run after a delay.
///
/// The engine uses a scheduler, when configured, to pace cleanup at the next
/// expiration deadline instead of waiting for cache activity.
pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run after `delay_nanos`, returning a cancelable
    /// handle.
    fn schedule(&self, delay_nanos: u64, task: Task) -> Arc<dyn ScheduledTask>;
}

/// A [`ScheduledTask`] recording only its cancellation flag.
///
/// Useful for schedulers whose transport has no cancellation of its own; the
/// fired task should check [`ScheduledTask::is_cancelled`] before running.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
}

impl CancelFlag {
    /// Creates an uncancelled flag.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduledTask for CancelFlag {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
