//! Response caching subsystem.
//!
//! - [`ResponseCache`]: the governor-facing cache with TTL defaults, per-category
//!   overrides, and graceful degradation. Any backend failure is logged and
//!   treated as a miss; the cache never fails a request.
//!
//! - [`CacheBackend`]: storage seam behind the cache. [`MemoryBackend`]
//!   (moka, bounded LRU with per-entry expiry) ships in-crate; a networked
//!   store plugs in by implementing the trait and passing it to
//!   [`ResponseCache::with_backend`].
//!
//! - [`CacheKey`]: deterministic, argument-order-independent key over a
//!   tool name and its normalized arguments.

pub mod key;
pub mod memory;
pub mod response;

pub use key::CacheKey;
pub use memory::MemoryBackend;
pub use response::{CacheConfig, CacheLookup, ResponseCache};

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::Result;

/// A cached value with its expiry metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(value: serde_json::Value, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Whether the entry is past `created_at + ttl` at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Storage behind [`ResponseCache`].
///
/// Implementations must tolerate concurrent `get`/`put` for the same key
/// without exposing torn values; last-writer-wins is acceptable.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs and health output.
    fn name(&self) -> &str;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()>;

    async fn remove(&self, key: &CacheKey) -> Result<()>;

    /// Drop `key` if the entry stored now has expired at `now`.
    ///
    /// The check and the removal must be atomic: an entry written after an
    /// expired one was read must survive. Backends that expire entries on
    /// their own may keep the default no-op.
    async fn remove_expired(&self, _key: &CacheKey, _now: Instant) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()>;

    /// Connectivity check used by health reporting.
    async fn ping(&self) -> Result<()>;
}
