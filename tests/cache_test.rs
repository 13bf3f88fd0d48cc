//! Response cache behaviour: TTLs, key normalization, and degradation when
//! the backend is unavailable.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use tollgate::cache::{
    CacheBackend, CacheConfig, CacheEntry, CacheKey, CacheLookup, MemoryBackend, ResponseCache,
};
use tollgate::{Result, TollgateError};

/// Backend whose every operation fails, like an unreachable network store.
#[derive(Default)]
struct DownBackend {
    attempts: AtomicU32,
}

impl DownBackend {
    fn fail(&self) -> TollgateError {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        TollgateError::CacheUnavailable("connection refused".into())
    }
}

#[async_trait]
impl CacheBackend for DownBackend {
    fn name(&self) -> &str {
        "down"
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>> {
        Err(self.fail())
    }

    async fn put(&self, _key: &CacheKey, _entry: CacheEntry) -> Result<()> {
        Err(self.fail())
    }

    async fn remove(&self, _key: &CacheKey) -> Result<()> {
        Err(self.fail())
    }

    async fn clear(&self) -> Result<()> {
        Err(self.fail())
    }

    async fn ping(&self) -> Result<()> {
        Err(self.fail())
    }
}

#[tokio::test]
async fn miss_then_hit() {
    let cache = ResponseCache::new(CacheConfig::new());
    let key = CacheKey::new("search_properties", &json!({"city": "Austin", "beds": 3}));

    assert_eq!(cache.lookup(&key).await, CacheLookup::Miss);
    cache.store(&key, json!({"listings": 12}), None).await;
    assert_eq!(
        cache.lookup(&key).await,
        CacheLookup::Hit(json!({"listings": 12}))
    );
}

#[tokio::test]
async fn argument_order_does_not_matter() {
    let cache = ResponseCache::new(CacheConfig::new());
    let a = CacheKey::new("search_properties", &json!({"city": "Austin", "beds": 3}));
    let b = CacheKey::new("search_properties", &json!({"beds": 3, "city": "Austin"}));
    assert_eq!(a, b);

    cache.store(&a, json!("cached"), None).await;
    assert!(cache.lookup(&b).await.is_hit());
}

#[tokio::test]
async fn different_tools_never_collide() {
    let args = json!({"address": "1 Main St"});
    let geocode = CacheKey::new("geocode", &args);
    let valuation = CacheKey::new("valuation", &args);
    assert_ne!(geocode, valuation);
    assert_eq!(geocode.tool(), "geocode");
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_ttl() {
    let cache = ResponseCache::new(CacheConfig::new().ttl(Duration::from_secs(60)));
    let key = CacheKey::new("t", &json!({"q": 1}));
    cache.store(&key, json!(1), None).await;

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(cache.lookup(&key).await.is_hit());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.lookup(&key).await, CacheLookup::Miss);
}

#[tokio::test(start_paused = true)]
async fn category_ttl_applies_per_tool() {
    let cache = ResponseCache::new(
        CacheConfig::new()
            .ttl(Duration::from_secs(3600))
            .category_ttl("market_data", Duration::from_secs(300)),
    );
    let market = CacheKey::new("market_data", &json!({"zip": "78701"}));
    let geocode = CacheKey::new("geocode", &json!({"zip": "78701"}));
    cache.store(&market, json!("m"), None).await;
    cache.store(&geocode, json!("g"), None).await;

    tokio::time::advance(Duration::from_secs(301)).await;
    assert!(!cache.lookup(&market).await.is_hit());
    assert!(cache.lookup(&geocode).await.is_hit());
}

#[tokio::test(start_paused = true)]
async fn explicit_ttl_wins() {
    let cache = ResponseCache::new(CacheConfig::new().ttl(Duration::from_secs(3600)));
    let key = CacheKey::new("t", &json!({}));
    cache.store(&key, json!(1), Some(Duration::from_secs(5))).await;
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!cache.lookup(&key).await.is_hit());
}

#[tokio::test]
async fn overwrite_replaces_value() {
    let cache = ResponseCache::new(CacheConfig::new());
    let key = CacheKey::new("t", &json!({}));
    cache.store(&key, json!("old"), None).await;
    cache.store(&key, json!("new"), None).await;
    assert_eq!(cache.lookup(&key).await, CacheLookup::Hit(json!("new")));
}

#[tokio::test]
async fn invalidate_and_clear() {
    let cache = ResponseCache::new(CacheConfig::new());
    let a = CacheKey::new("t", &json!({"n": 1}));
    let b = CacheKey::new("t", &json!({"n": 2}));
    cache.store(&a, json!(1), None).await;
    cache.store(&b, json!(2), None).await;

    cache.invalidate(&a).await;
    assert!(!cache.lookup(&a).await.is_hit());
    assert!(cache.lookup(&b).await.is_hit());

    cache.clear().await;
    assert!(!cache.lookup(&b).await.is_hit());
}

#[tokio::test]
async fn unavailable_backend_degrades_to_miss() {
    let backend = Arc::new(DownBackend::default());
    let cache = ResponseCache::with_backend(CacheConfig::new(), backend.clone());
    let key = CacheKey::new("t", &json!({}));

    cache.store(&key, json!(1), None).await;
    assert_eq!(cache.lookup(&key).await, CacheLookup::Miss);
    cache.invalidate(&key).await;
    assert!(!cache.is_available().await);
    assert_eq!(backend.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(cache.backend_name(), "down");
}

#[tokio::test]
async fn memory_backend_is_always_available() {
    let cache = ResponseCache::with_backend(CacheConfig::new(), Arc::new(MemoryBackend::new()));
    assert!(cache.is_available().await);
    assert_eq!(cache.backend_name(), "memory");
}

#[tokio::test(start_paused = true)]
async fn expiry_cleanup_spares_a_newer_write() {
    let backend = MemoryBackend::new();
    let key = CacheKey::new("search", &json!({"city": "austin"}));
    backend
        .put(&key, CacheEntry::new(json!("stale"), Duration::from_secs(1)))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let now = tokio::time::Instant::now();
    assert!(backend.get(&key).await.unwrap().unwrap().is_expired_at(now));

    // a fresh store lands between the expired read and the cleanup
    backend
        .put(&key, CacheEntry::new(json!("fresh"), Duration::from_secs(60)))
        .await
        .unwrap();
    backend.remove_expired(&key, now).await.unwrap();
    assert_eq!(backend.get(&key).await.unwrap().unwrap().value, json!("fresh"));

    tokio::time::advance(Duration::from_secs(61)).await;
    backend
        .remove_expired(&key, tokio::time::Instant::now())
        .await
        .unwrap();
    assert!(backend.get(&key).await.unwrap().is_none());
}
