//! In-process cache backend.

use std::time::Duration;

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::Op;
use tokio::time::Instant;

use super::{CacheBackend, CacheEntry, CacheKey};
use crate::Result;

/// Default maximum number of entries held in memory.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Expire each entry after its own TTL, restarting on overwrite.
struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded LRU backend built on moka.
///
/// moka evicts expired entries on its own schedule;
/// [`ResponseCache`](super::ResponseCache) additionally checks expiry on
/// every read, so an entry is never served past its TTL either way.
pub struct MemoryBackend {
    entries: Cache<String, CacheEntry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max)
            .expire_after(EntryTtl)
            .build();
        Self { entries }
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key.as_str()).await)
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        self.entries.insert(key.as_str().to_owned(), entry).await;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.entries.invalidate(key.as_str()).await;
        Ok(())
    }

    async fn remove_expired(&self, key: &CacheKey, now: Instant) -> Result<()> {
        self.entries
            .entry(key.as_str().to_owned())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().is_expired_at(now) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.invalidate_all();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
