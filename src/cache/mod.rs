//! Response caching layer — TTL-bounded LRU storage, single-flight request
//! coalescing, response capture, and the middleware that ties them together.
//!
//! ## Core types
//!
//! - [`CacheStore`] — bounded, TTL-aware LRU store for finalized responses.
//! - [`Singleflight`] — per-key coalescing of concurrent duplicate work.
//! - [`ResponseCapture`] — buffering sink with a one-shot completion signal.
//! - [`CacheMiddleware`] — the orchestrator mounted into the handler chain.
//! - [`CacheConfig`] / [`ConfigError`] — setup parameters and their validation.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub mod capture;
pub mod middleware;
pub mod singleflight;
pub mod store;

pub use capture::ResponseCapture;
pub use middleware::{CacheMiddleware, REPLAY_CONTENT_TYPE};
pub use singleflight::Singleflight;
pub use store::{CacheStore, CachedResponse};

/// Setup errors surfaced before any request is served.
///
/// A middleware with an invalid configuration is never activated; these are
/// construction-time failures, not request-time ones.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache path suffix must not be empty")]
    EmptySuffix,

    #[error("cache capacity must be at least 1")]
    ZeroCapacity,

    #[error("cache TTL must be non-zero")]
    ZeroTtl,
}

/// Configuration for the caching middleware.
///
/// Only requests whose path ends with `suffix` (exact, byte-wise,
/// case-sensitive) are cached; everything else passes through untouched.
/// The store holds at most `capacity` distinct paths, each visible for `ttl`
/// after insertion.
///
/// Deserializes from external configuration with the numeric fields
/// defaulted and the TTL in human-readable form:
///
/// ```json
/// { "suffix": ".json", "capacity": 3000, "ttl": "60s" }
/// ```
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cachegate::cache::CacheConfig;
///
/// let config = CacheConfig::new(".json")
///     .with_capacity(1024)
///     .with_ttl(Duration::from_secs(30));
/// assert_eq!(config.suffix, ".json");
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Path suffix that marks a request as cacheable.
    pub suffix: String,

    /// Maximum number of distinct paths held at once; inserting beyond this
    /// evicts the least-recently-used entry.
    #[serde(default = "CacheConfig::default_capacity")]
    pub capacity: usize,

    /// Time-to-live: how long an entry is served after insertion.
    #[serde(default = "CacheConfig::default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl CacheConfig {
    /// Creates a configuration for the given path suffix with the default
    /// capacity (3000 entries) and TTL (60 seconds).
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            capacity: Self::default_capacity(),
            ttl: Self::default_ttl(),
        }
    }

    /// Sets the maximum number of distinct paths held at once.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the time-to-live for cached entries.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Checks the configuration for values that would make the middleware
    /// inoperable.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptySuffix`] for an empty suffix (it would match every
    /// path), [`ConfigError::ZeroCapacity`] or [`ConfigError::ZeroTtl`] for
    /// degenerate cache parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.suffix.is_empty() {
            return Err(ConfigError::EmptySuffix);
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        Ok(())
    }

    fn default_capacity() -> usize {
        3000
    }

    fn default_ttl() -> Duration {
        Duration::from_secs(60)
    }
}
