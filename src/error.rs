//! Error types for the windcache library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache configuration parameters are invalid
//!   (e.g. a zero initial capacity hint larger than the maximum, or an
//!   expiration duration that overflows the nanosecond clock).
//!
//! ## Example Usage
//!
//! ```
//! use windcache::builder::CacheBuilder;
//! use windcache::cache::BoundedCache;
//! use windcache::error::ConfigError;
//!
//! // Fallible construction for user-supplied parameters
//! let cache: Result<BoundedCache<u64, String>, ConfigError> =
//!     CacheBuilder::new().maximum_size(1024).try_build();
//! assert!(cache.is_ok());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`CacheBuilder::try_build`](crate::builder::CacheBuilder::try_build).
/// Carries a human-readable description of which parameter failed validation.
///
/// # Example
///
/// ```
/// use windcache::error::ConfigError;
///
/// let err = ConfigError::new("maximum must be greater than zero");
/// assert!(err.to_string().contains("maximum"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
