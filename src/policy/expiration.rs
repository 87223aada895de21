//! Expiration configuration and deadline checks.
//!
//! Three expiration flavours compose freely:
//!
//! - **after-access**: an entry dies a fixed duration after its last read or
//!   write; ordered by the region access deques.
//! - **after-write**: an entry dies a fixed duration after its last write;
//!   ordered by the write-order deque.
//! - **variable**: a per-entry deadline computed by a user [`Expiry`] policy
//!   on create/update/read; ordered by the timer wheel.
//!
//! Fixed durations are runtime-adjustable (the policy introspection API
//! allows tightening or loosening a live cache); entries re-sort lazily on
//! their next touch, and the next maintenance pass applies the new bound to
//! the deque heads.
//!
//! ## Write tolerance
//!
//! Rapid same-key updates would otherwise churn the write buffer just to
//! re-order an entry by nanoseconds. An update whose previous write is
//! within [`EXPIRE_WRITE_TOLERANCE`], and whose variable deadline moved by
//! no more than the tolerance, is demoted to a read event instead.

use crate::traits::Expiry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Updates within this window of the previous write are treated as reads.
pub const EXPIRE_WRITE_TOLERANCE: u64 = 1_000_000_000;

/// Sentinel for a disabled fixed duration.
const DISABLED: u64 = u64::MAX;

/// Expiration configuration shared by the hot paths and the drain.
pub struct ExpirationPolicy<K, V> {
    after_access: AtomicU64,
    after_write: AtomicU64,
    expiry: Option<Arc<dyn Expiry<K, V>>>,
}

impl<K, V> std::fmt::Debug for ExpirationPolicy<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationPolicy")
            .field("after_access", &self.access_nanos())
            .field("after_write", &self.write_nanos())
            .field("variable", &self.expiry.is_some())
            .finish()
    }
}

impl<K, V> ExpirationPolicy<K, V> {
    /// Creates a policy from optional fixed durations and an optional
    /// per-entry expiry.
    pub fn new(
        after_access: Option<u64>,
        after_write: Option<u64>,
        expiry: Option<Arc<dyn Expiry<K, V>>>,
    ) -> Self {
        Self {
            after_access: AtomicU64::new(after_access.unwrap_or(DISABLED)),
            after_write: AtomicU64::new(after_write.unwrap_or(DISABLED)),
            expiry,
        }
    }

    /// Fixed after-access duration, if enabled.
    #[inline]
    pub fn access_nanos(&self) -> Option<u64> {
        match self.after_access.load(Ordering::Relaxed) {
            DISABLED => None,
            nanos => Some(nanos),
        }
    }

    /// Fixed after-write duration, if enabled.
    #[inline]
    pub fn write_nanos(&self) -> Option<u64> {
        match self.after_write.load(Ordering::Relaxed) {
            DISABLED => None,
            nanos => Some(nanos),
        }
    }

    /// Replaces the after-access duration. `None` disables it for future
    /// checks; entries already recorded keep their order.
    pub fn set_access_nanos(&self, nanos: Option<u64>) {
        self.after_access
            .store(nanos.unwrap_or(DISABLED), Ordering::Relaxed);
    }

    /// Replaces the after-write duration.
    pub fn set_write_nanos(&self, nanos: Option<u64>) {
        self.after_write
            .store(nanos.unwrap_or(DISABLED), Ordering::Relaxed);
    }

    /// The per-entry expiry policy, if configured.
    #[inline]
    pub fn expiry(&self) -> Option<&Arc<dyn Expiry<K, V>>> {
        self.expiry.as_ref()
    }

    #[inline]
    pub fn expires_after_access(&self) -> bool {
        self.access_nanos().is_some()
    }

    #[inline]
    pub fn expires_after_write(&self) -> bool {
        self.write_nanos().is_some()
    }

    #[inline]
    pub fn has_variable(&self) -> bool {
        self.expiry.is_some()
    }

    /// Returns `true` if any expiration flavour is enabled.
    #[inline]
    pub fn expires(&self) -> bool {
        self.expires_after_access() || self.expires_after_write() || self.has_variable()
    }

    /// Checks whether an entry with the given timestamps is expired at `now`.
    ///
    /// `variable_time` is the absolute per-entry deadline
    /// (`u64::MAX` when unused).
    pub fn is_expired(&self, access_time: u64, write_time: u64, variable_time: u64, now: u64) -> bool {
        if let Some(nanos) = self.access_nanos() {
            if now.saturating_sub(access_time) >= nanos {
                return true;
            }
        }
        if let Some(nanos) = self.write_nanos() {
            if now.saturating_sub(write_time) >= nanos {
                return true;
            }
        }
        self.expiry.is_some() && variable_time <= now
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
