//! Curated re-exports for typical use.

pub use crate::builder::CacheBuilder;
pub use crate::cache::{BoundedCache, DebugStats};
pub use crate::error::ConfigError;
pub use crate::store::node::ReferenceStrength;
pub use crate::traits::{
    unit_weigher, DirectExecutor, Executor, Expiry, FakeTicker, Listener, RemovalCause,
    Scheduler, ScheduledTask, SystemTicker, Task, Ticker, Weigher,
};
