//! Process-wide request metrics.
//!
//! [`MetricsCollector`] backs the `/metrics` endpoint. Counters are atomics;
//! per-endpoint and per-error-kind stats live in a [`DashMap`] so unrelated
//! labels never contend on a shared lock. Every record is mirrored to the
//! `metrics` facade using the names in [`telemetry`].
//!
//! `errors_total` counts failed requests. [`MetricsCollector::record_error`]
//! only feeds the per-kind breakdown, so a failed request is never counted
//! twice.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::telemetry;

/// Upper bounds of the latency histogram buckets, in milliseconds.
pub const LATENCY_BUCKETS_MS: [u64; 12] =
    [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

/// Outcome of a governed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "ok",
            Outcome::Failure => "error",
        }
    }
}

#[derive(Default)]
struct EndpointStats {
    count: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
    // one slot per bucket plus overflow
    latency: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

impl EndpointStats {
    fn record(&self, duration: Duration, outcome: Outcome) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if outcome == Outcome::Failure {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        let ms = micros / 1_000;
        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency[slot].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EndpointSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_micros = self.total_micros.load(Ordering::Relaxed);
        let mut cumulative = 0;
        let mut buckets = Vec::with_capacity(self.latency.len());
        for (i, slot) in self.latency.iter().enumerate() {
            cumulative += slot.load(Ordering::Relaxed);
            let le = LATENCY_BUCKETS_MS
                .get(i)
                .map_or_else(|| "+Inf".to_string(), |b| b.to_string());
            buckets.push(LatencyBucket {
                le_ms: le,
                count: cumulative,
            });
        }
        EndpointSnapshot {
            count,
            errors: self.errors.load(Ordering::Relaxed),
            total_duration_ms: total_micros as f64 / 1_000.0,
            avg_response_time: mean_ms(total_micros, count),
            latency: buckets,
        }
    }

    fn clear(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.total_micros.store(0, Ordering::Relaxed);
        for slot in &self.latency {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

fn mean_ms(total_micros: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_micros as f64 / count as f64 / 1_000.0
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Cumulative latency bucket (`count` requests took at most `le_ms`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyBucket {
    pub le_ms: String,
    pub count: u64,
}

/// Point-in-time stats for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub count: u64,
    pub errors: u64,
    pub total_duration_ms: f64,
    /// Mean latency in milliseconds.
    pub avg_response_time: f64,
    pub latency: Vec<LatencyBucket>,
}

/// Serializable copy of all collected metrics.
///
/// Durations are in milliseconds; rates are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_by_endpoint: BTreeMap<String, EndpointSnapshot>,
    pub errors_total: u64,
    pub errors_by_type: BTreeMap<String, u64>,
    pub avg_response_time: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub rate_limit_denials: u64,
}

/// Concurrent metrics store.
#[derive(Default)]
pub struct MetricsCollector {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    total_micros: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limit_denials: AtomicU64,
    endpoints: DashMap<String, Arc<EndpointStats>>,
    errors_by_type: DashMap<String, AtomicU64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(&self, endpoint: &str) -> Arc<EndpointStats> {
        if let Some(stats) = self.endpoints.get(endpoint) {
            return Arc::clone(&stats);
        }
        Arc::clone(&self.endpoints.entry(endpoint.to_owned()).or_default())
    }

    /// Record one completed request.
    pub fn record_request(&self, endpoint: &str, duration: Duration, outcome: Outcome) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if outcome == Outcome::Failure {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.endpoint(endpoint).record(duration, outcome);

        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "endpoint" => endpoint.to_owned(),
            "status" => outcome.as_str(),
        )
        .increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "endpoint" => endpoint.to_owned(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record an error by its stable kind.
    pub fn record_error(&self, kind: &str) {
        match self.errors_by_type.get(kind) {
            Some(count) => {
                count.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.errors_by_type
                    .entry(kind.to_owned())
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics::counter!(telemetry::ERRORS_TOTAL, "kind" => kind.to_owned()).increment(1);
    }

    pub fn record_cache_outcome(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limit(&self, allowed: bool) {
        if !allowed {
            self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the current values.
    ///
    /// Never blocks writers beyond a per-shard read of the label maps.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let errors_total = self.errors_total.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);

        let requests_by_endpoint = self
            .endpoints
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        let errors_by_type = self
            .errors_by_type
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            requests_total,
            requests_by_endpoint,
            errors_total,
            errors_by_type,
            avg_response_time: mean_ms(self.total_micros.load(Ordering::Relaxed), requests_total),
            cache_hits,
            cache_misses,
            cache_hit_rate: ratio(cache_hits, cache_hits + cache_misses),
            error_rate: ratio(errors_total, requests_total),
            rate_limit_denials: self.rate_limit_denials.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter. Endpoint and error-kind labels are kept.
    pub fn reset(&self) {
        for counter in [
            &self.requests_total,
            &self.errors_total,
            &self.total_micros,
            &self.cache_hits,
            &self.cache_misses,
            &self.rate_limit_denials,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for stats in self.endpoints.iter() {
            stats.clear();
        }
        for count in self.errors_by_type.iter() {
            count.store(0, Ordering::Relaxed);
        }
    }
}
