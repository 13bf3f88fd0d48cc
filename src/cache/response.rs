//! Governor-facing response cache.
//!
//! [`ResponseCache`] sits in [`RequestGovernor`](crate::governor::RequestGovernor)
//! between admission control and the token budget. A hit bypasses the
//! budget check, retries and the upstream agent call entirely.
//!
//! # Degradation
//!
//! The cache is an optimization only. Every backend error is absorbed:
//! lookups degrade to [`CacheLookup::Miss`], stores are dropped, and the
//! failure is logged at `debug` and counted in
//! [`CACHE_BACKEND_ERRORS_TOTAL`](crate::telemetry::CACHE_BACKEND_ERRORS_TOTAL).
//!
//! # Expiry
//!
//! Entries carry their own TTL (the default, or a per-category override for
//! time-sensitive data such as market figures). Reads that find an expired
//! entry behave as a miss and remove the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{CacheBackend, CacheEntry, CacheKey, MemoryBackend};
use crate::telemetry;

/// Configuration for the response cache.
///
/// ```rust
/// # use tollgate::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600))
///     .category_ttl("market_data", Duration::from_secs(300));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether caching is active. Disabled caches always miss. Default: true.
    pub enabled: bool,
    /// Maximum number of entries for the in-memory backend. Default: 10,000.
    pub max_entries: u64,
    /// Default time-to-live. Default: 1 hour.
    pub ttl: Duration,
    /// TTL overrides keyed by category (usually the tool name).
    pub category_ttl: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: super::memory::DEFAULT_MAX_ENTRIES,
            ttl: Duration::from_secs(3600),
            category_ttl: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the cache.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the default time-to-live.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the TTL for one category.
    pub fn category_ttl(mut self, category: impl Into<String>, ttl: Duration) -> Self {
        self.category_ttl.insert(category.into(), ttl);
        self
    }
}

/// Result of [`ResponseCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(serde_json::Value),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// TTL cache over a pluggable [`CacheBackend`].
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl ResponseCache {
    /// Create a cache backed by an in-memory [`MemoryBackend`].
    pub fn new(config: CacheConfig) -> Self {
        let backend = Arc::new(MemoryBackend::with_max_entries(config.max_entries));
        Self::with_backend(config, backend)
    }

    /// Create a cache over an arbitrary backend.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// TTL for a category, falling back to the default.
    pub fn ttl_for(&self, category: &str) -> Duration {
        self.config
            .category_ttl
            .get(category)
            .copied()
            .unwrap_or(self.config.ttl)
    }

    /// Look up a key. Expired entries and backend failures are misses.
    pub async fn lookup(&self, key: &CacheKey) -> CacheLookup {
        if !self.config.enabled {
            return CacheLookup::Miss;
        }
        let category = key.tool().to_owned();
        let now = Instant::now();
        let outcome = match self.backend.get(key).await {
            Ok(Some(entry)) if entry.is_expired_at(now) => {
                self.absorb(self.backend.remove_expired(key, now).await, "remove");
                CacheLookup::Miss
            }
            Ok(Some(entry)) => CacheLookup::Hit(entry.value),
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                self.absorb(Err(e), "get");
                CacheLookup::Miss
            }
        };
        if outcome.is_hit() {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "category" => category).increment(1);
        } else {
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "category" => category).increment(1);
        }
        outcome
    }

    /// Store a value. `ttl = None` uses the key's category TTL.
    pub async fn store(&self, key: &CacheKey, value: serde_json::Value, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(key.tool()));
        let result = self.backend.put(key, CacheEntry::new(value, ttl)).await;
        self.absorb(result, "put");
    }

    /// Remove a single entry.
    pub async fn invalidate(&self, key: &CacheKey) {
        let result = self.backend.remove(key).await;
        self.absorb(result, "remove");
    }

    /// Remove every entry.
    pub async fn clear(&self) {
        let result = self.backend.clear().await;
        self.absorb(result, "clear");
    }

    /// Whether the backend is reachable.
    pub async fn is_available(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(backend = self.backend.name(), error = %e, "cache backend ping failed");
                false
            }
        }
    }

    fn absorb(&self, result: crate::Result<()>, op: &'static str) {
        if let Err(e) = result {
            debug!(
                backend = self.backend.name(),
                op,
                error = %e,
                "cache backend unavailable, degrading to miss"
            );
            metrics::counter!(telemetry::CACHE_BACKEND_ERRORS_TOTAL, "op" => op).increment(1);
        }
    }
}
