//! Per-client admission control.
//!
//! [`RateLimiter`] keeps one token bucket per client key (the source IP at
//! the HTTP boundary). Each admission refills the bucket for the elapsed
//! time, then consumes one token if at least one is available.
//!
//! Buckets live in a sharded [`DashMap`]; a bucket is mutated only while its
//! entry guard is held, so concurrent admissions for the same key are
//! linearizable while unrelated keys proceed in parallel.
//!
//! Buckets are created lazily and evicted after an idle window. Eviction is
//! safe because a long-idle bucket has refilled to capacity, which is exactly
//! the state of a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;

/// Capacity and refill rate of a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketLimits {
    /// Maximum tokens (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Limits applied to clients without an override. Default: 100 burst, 100/min refill.
    pub default_limits: BucketLimits,
    /// Buckets untouched for longer than this are evicted. Default: 10 minutes.
    pub idle_timeout: Duration,
    /// How often the background sweeper runs. Default: 60s.
    pub sweep_interval: Duration,
    /// Per-client overrides keyed by client key.
    pub overrides: HashMap<String, BucketLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limits: BucketLimits {
                capacity: 100,
                refill_per_sec: 100.0 / 60.0,
            },
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default bucket capacity and refill rate.
    pub fn limits(mut self, capacity: u32, refill_per_sec: f64) -> Self {
        self.default_limits = BucketLimits {
            capacity,
            refill_per_sec,
        };
        self
    }

    /// Set the idle window after which buckets are evicted.
    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    /// Set the sweeper interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Override the limits for one client key.
    pub fn override_client(mut self, client_key: impl Into<String>, limits: BucketLimits) -> Self {
        self.overrides.insert(client_key.into(), limits);
        self
    }

    fn limits_for(&self, client_key: &str) -> BucketLimits {
        self.overrides
            .get(client_key)
            .copied()
            .unwrap_or(self.default_limits)
    }
}

/// Observable limiter state, suitable for `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitInfo {
    /// Bucket capacity.
    pub limit: u32,
    /// Whole tokens left after this decision.
    pub remaining: u32,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
}

/// Outcome of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed(RateLimitInfo),
    Denied {
        info: RateLimitInfo,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }

    pub fn info(&self) -> RateLimitInfo {
        match self {
            Admission::Allowed(info) | Admission::Denied { info, .. } => *info,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitBucket {
    fn full(limits: BucketLimits, now: Instant) -> Self {
        let capacity = f64::from(limits.capacity);
        Self {
            capacity,
            refill_per_sec: limits.refill_per_sec,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn is_full_at(&self, now: Instant) -> bool {
        let mut projected = *self;
        projected.refill(now);
        projected.tokens >= projected.capacity
    }

    fn info(&self) -> RateLimitInfo {
        let missing = (self.capacity - self.tokens).max(0.0);
        RateLimitInfo {
            limit: self.capacity as u32,
            remaining: self.tokens.floor() as u32,
            reset_after: secs_to_duration(missing / self.refill_per_sec),
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Token-bucket rate limiter keyed by client.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, RateLimitBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `client_key` may proceed, consuming one token if so.
    pub fn admit(&self, client_key: &str) -> Admission {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(client_key.to_owned())
            .or_insert_with(|| RateLimitBucket::full(self.config.limits_for(client_key), now));
        bucket.refill(now);

        let admission = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Admission::Allowed(bucket.info())
        } else {
            let retry_after = secs_to_duration((1.0 - bucket.tokens) / bucket.refill_per_sec);
            Admission::Denied {
                info: bucket.info(),
                retry_after,
            }
        };
        drop(bucket);

        let decision = if admission.is_allowed() {
            "allowed"
        } else {
            "denied"
        };
        metrics::counter!(telemetry::RATE_LIMIT_DECISIONS_TOTAL, "decision" => decision)
            .increment(1);
        admission
    }

    /// Current state of a client's bucket without consuming a token.
    ///
    /// Returns `None` if the client has no bucket (never seen or evicted).
    pub fn peek(&self, client_key: &str) -> Option<RateLimitInfo> {
        let bucket = self.buckets.get(client_key)?;
        let mut projected = *bucket;
        projected.refill(Instant::now());
        Some(projected.info())
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Remove buckets idle for longer than the configured window.
    ///
    /// A bucket is only evicted once it would have refilled to capacity;
    /// until then dropping it would hand the client a full fresh bucket.
    /// Returns the number of evicted buckets.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_timeout;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_refill) < idle || !bucket.is_full_at(now)
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "evicted idle rate-limit buckets");
            metrics::counter!(telemetry::RATE_LIMIT_EVICTIONS_TOTAL).increment(evicted as u64);
        }
        evicted
    }

    /// Spawn a background task that evicts idle buckets periodically.
    ///
    /// The task holds only a weak reference and exits once the limiter is
    /// dropped. Requires a tokio runtime context.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(limiter) => {
                        limiter.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new().limits(capacity, refill))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_deny() {
        let limiter = limiter(5, 1.0);
        for _ in 0..5 {
            assert!(limiter.admit("10.0.0.1").is_allowed());
        }
        match limiter.admit("10.0.0.1") {
            Admission::Denied { retry_after, info } => {
                assert!(retry_after > Duration::ZERO);
                assert_eq!(info.remaining, 0);
                assert_eq!(info.limit, 5);
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refill_admits_exactly_one_after_one_second() {
        let limiter = limiter(5, 1.0);
        for _ in 0..5 {
            assert!(limiter.admit("k").is_allowed());
        }
        assert!(!limiter.admit("k").is_allowed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.admit("k").is_allowed());
        assert!(!limiter.admit("k").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_reflects_missing_fraction() {
        let limiter = limiter(1, 2.0);
        assert!(limiter.admit("k").is_allowed());
        tokio::time::advance(Duration::from_millis(250)).await;
        match limiter.admit("k") {
            Admission::Denied { retry_after, .. } => {
                // 0.5 tokens present, 0.5 missing at 2 tokens/s
                assert_eq!(retry_after, Duration::from_millis(250));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_capacity() {
        let limiter = limiter(3, 10.0);
        assert!(limiter.admit("k").is_allowed());
        tokio::time::advance(Duration::from_secs(3600)).await;
        let info = limiter.peek("k").unwrap();
        assert_eq!(info.remaining, 3);
        assert_eq!(info.reset_after, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_independent() {
        let limiter = limiter(1, 0.1);
        assert!(limiter.admit("a").is_allowed());
        assert!(!limiter.admit("a").is_allowed());
        assert!(limiter.admit("b").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn override_applies_to_named_client() {
        let config = RateLimitConfig::new().limits(1, 1.0).override_client(
            "trusted",
            BucketLimits {
                capacity: 10,
                refill_per_sec: 1.0,
            },
        );
        let limiter = RateLimiter::new(config);
        assert_eq!(limiter.admit("trusted").info().limit, 10);
        assert_eq!(limiter.admit("other").info().limit, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buckets_are_evicted() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .limits(2, 1.0)
                .idle_timeout(Duration::from_secs(600)),
        );
        limiter.admit("old");
        tokio::time::advance(Duration::from_secs(601)).await;
        limiter.admit("fresh");

        assert_eq!(limiter.evict_idle(), 1);
        assert!(limiter.peek("old").is_none());
        assert!(limiter.peek("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_survives_idle_window_until_refilled() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .limits(5, 0.01)
                .idle_timeout(Duration::from_secs(10)),
        );
        for _ in 0..5 {
            assert!(limiter.admit("slow").is_allowed());
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(limiter.evict_idle(), 0);
        let admitted = (0..5).filter(|_| limiter.admit("slow").is_allowed()).count();
        assert_eq!(admitted, 0);

        // 500s refills all 5 tokens; only then may the bucket go
        tokio::time::advance(Duration::from_secs(501)).await;
        assert_eq!(limiter.evict_idle(), 1);
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_in_background() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::new()
                .idle_timeout(Duration::from_secs(10))
                .sweep_interval(Duration::from_secs(5)),
        ));
        limiter.admit("k");
        let handle = limiter.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(limiter.is_empty());
        handle.abort();
    }
}
