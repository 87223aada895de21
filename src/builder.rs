//! Cache builder wiring configuration into the engine.
//!
//! Collects the capacity bound, weighing, expiration flavours, reference
//! strength, and the environment seams (ticker, executor, scheduler,
//! listeners), then assembles a [`BoundedCache`]. Every option has a
//! production-grade default; tests typically swap in a [`FakeTicker`] and a
//! recording executor.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use windcache::builder::CacheBuilder;
//! use windcache::cache::BoundedCache;
//!
//! let cache: BoundedCache<u64, String> = CacheBuilder::new()
//!     .maximum_size(10_000)
//!     .expire_after_access(Duration::from_secs(300))
//!     .build();
//!
//! cache.put(1, "hello".to_string());
//! assert_eq!(cache.get(&1).as_deref().map(String::as_str), Some("hello"));
//! ```
//!
//! [`FakeTicker`]: crate::traits::FakeTicker

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{BoundedCache, CacheConfig};
use crate::error::ConfigError;
use crate::policy::expiration::ExpirationPolicy;
use crate::store::node::ReferenceStrength;
use crate::traits::{
    unit_weigher, DirectExecutor, Executor, Expiry, Listener, Scheduler, SystemTicker, Ticker,
    Weigher,
};

/// Default number of map shards.
const DEFAULT_SHARDS: usize = 16;

/// Default capacity of the lossless write buffer.
const DEFAULT_WRITE_BUFFER_SIZE: usize = 128;

/// Read events buffered per logical CPU.
const READ_BUFFER_PER_CPU: usize = 16;

/// Builder for [`BoundedCache`] instances.
///
/// # Example
///
/// ```
/// use windcache::builder::CacheBuilder;
/// use windcache::cache::BoundedCache;
///
/// // Weight-bounded: each entry weighs its value
/// let cache: BoundedCache<u64, u32> = CacheBuilder::new()
///     .maximum_weight(1_024)
///     .weigher(|_k: &u64, v: &u32| *v)
///     .build();
/// ```
pub struct CacheBuilder<K, V> {
    maximum: Option<u64>,
    weighted: bool,
    initial_capacity: usize,
    value_strength: ReferenceStrength,
    expire_after_access: Option<Duration>,
    expire_after_write: Option<Duration>,
    expiry: Option<Arc<dyn Expiry<K, V>>>,
    weigher: Option<Arc<dyn Weigher<K, V>>>,
    ticker: Option<Arc<dyn Ticker>>,
    executor: Option<Arc<dyn Executor>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    eviction_listener: Option<Listener<K, V>>,
    removal_listener: Option<Listener<K, V>>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheBuilder<K, V> {
    /// Creates a builder for an unbounded cache with default collaborators.
    pub fn new() -> Self {
        Self {
            maximum: None,
            weighted: false,
            initial_capacity: 16,
            value_strength: ReferenceStrength::Strong,
            expire_after_access: None,
            expire_after_write: None,
            expiry: None,
            weigher: None,
            ticker: None,
            executor: None,
            scheduler: None,
            eviction_listener: None,
            removal_listener: None,
            _marker: PhantomData,
        }
    }

    /// Bounds the cache to `maximum` entries (each entry weighs one).
    pub fn maximum_size(mut self, maximum: u64) -> Self {
        self.maximum = Some(maximum);
        self.weighted = false;
        self
    }

    /// Bounds the cache to `maximum` total weight; requires a
    /// [`weigher`](Self::weigher).
    pub fn maximum_weight(mut self, maximum: u64) -> Self {
        self.maximum = Some(maximum);
        self.weighted = true;
        self
    }

    /// Sizing hint for the backing map.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Computes per-entry weights at insertion and update time.
    pub fn weigher(mut self, weigher: impl Weigher<K, V> + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Holds values strongly (default) or weakly. A weakly held value lives
    /// only while callers hold its `Arc`; collected values are evicted with
    /// cause `Collected`.
    pub fn value_reference(mut self, strength: ReferenceStrength) -> Self {
        self.value_strength = strength;
        self
    }

    /// Expires entries a fixed duration after their last read or write.
    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    /// Expires entries a fixed duration after their last write.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = Some(duration);
        self
    }

    /// Variable per-entry expiration policy.
    pub fn expiry(mut self, expiry: impl Expiry<K, V> + 'static) -> Self {
        self.expiry = Some(Arc::new(expiry));
        self
    }

    /// Time source; defaults to [`SystemTicker`].
    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Runs the maintenance task and removal notifications; defaults to
    /// [`DirectExecutor`]. A rejecting executor degrades the cache to
    /// synchronous draining, never to lost work.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Paces cleanup at the next expiration deadline; without one, expired
    /// entries are reclaimed on cache activity only.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Invoked synchronously, under the eviction lock, when the cache
    /// evicts an entry (size, expiry, or collection).
    pub fn eviction_listener(mut self, listener: Listener<K, V>) -> Self {
        self.eviction_listener = Some(listener);
        self
    }

    /// Invoked through the executor for every removal, user-initiated or
    /// not.
    pub fn removal_listener(mut self, listener: Listener<K, V>) -> Self {
        self.removal_listener = Some(listener);
        self
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Builds the cache.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid; use
    /// [`try_build`](Self::try_build) to handle errors.
    pub fn build(self) -> BoundedCache<K, V> {
        match self.try_build() {
            Ok(cache) => cache,
            Err(err) => panic!("invalid cache configuration: {err}"),
        }
    }

    /// Builds the cache, validating the configuration.
    pub fn try_build(self) -> Result<BoundedCache<K, V>, ConfigError> {
        if self.weighted && self.weigher.is_none() {
            return Err(ConfigError::new(
                "maximum_weight requires a weigher; use maximum_size for entry counts",
            ));
        }
        if !self.weighted && self.weigher.is_some() && self.maximum.is_some() {
            return Err(ConfigError::new(
                "weigher requires maximum_weight; maximum_size counts entries",
            ));
        }
        for duration in [self.expire_after_access, self.expire_after_write]
            .into_iter()
            .flatten()
        {
            if duration.as_nanos() > u64::MAX as u128 {
                return Err(ConfigError::new("expiration duration overflows nanoseconds"));
            }
        }

        let ncpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let expiration = ExpirationPolicy::new(
            self.expire_after_access.map(|d| d.as_nanos() as u64),
            self.expire_after_write.map(|d| d.as_nanos() as u64),
            self.expiry,
        );
        Ok(BoundedCache::from_config(CacheConfig {
            maximum: self.maximum,
            initial_capacity: self.initial_capacity,
            shards: DEFAULT_SHARDS,
            read_buffer_size: READ_BUFFER_PER_CPU * ncpus,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            value_strength: self.value_strength,
            expiration,
            weigher: self
                .weigher
                .unwrap_or_else(|| Arc::new(unit_weigher::<K, V>)),
            ticker: self.ticker.unwrap_or_else(|| Arc::new(SystemTicker::new())),
            executor: self.executor.unwrap_or_else(|| Arc::new(DirectExecutor)),
            scheduler: self.scheduler,
            eviction_listener: self.eviction_listener,
            removal_listener: self.removal_listener,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
