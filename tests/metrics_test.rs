//! Tests for metrics integration.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use tollgate::governor::GovernedRequest;
use tollgate::monitor::{MetricsCollector, Outcome};
use tollgate::ratelimit::{RateLimitConfig, RateLimiter};
use tollgate::retry::{RetryConfig, RetryExecutor};
use tollgate::telemetry;
use tollgate::types::{AgentQuery, AgentResult, ChatMessage, ChatRequest};
use tollgate::{AgentInvoker, RequestGovernor, Result, StorageRouter, TollgateError};

// ============================================================================
// Mock agents
// ============================================================================

struct OkAgent;

#[async_trait]
impl AgentInvoker for OkAgent {
    fn name(&self) -> &str {
        "ok"
    }

    async fn invoke(&self, _query: &AgentQuery) -> Result<AgentResult> {
        Ok(AgentResult {
            messages: vec![ChatMessage::ai("done")],
            ..Default::default()
        })
    }
}

struct RejectingAgent;

#[async_trait]
impl AgentInvoker for RejectingAgent {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn invoke(&self, _query: &AgentQuery) -> Result<AgentResult> {
        Err(TollgateError::Permanent {
            status: 400,
            message: "bad".into(),
        })
    }
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Sum counter values for a name whose labels include `label = value`.
fn counter_with_label(snapshot: &SnapshotVec, name: &str, label: &str, value: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter
                && key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label && l.value() == value)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Check if any histogram entries exist for a given metric name.
fn has_histogram(snapshot: &SnapshotVec, name: &str) -> bool {
    snapshot
        .iter()
        .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram && key.key().name() == name)
}

fn governor(agent: Arc<dyn AgentInvoker>, dir: &tempfile::TempDir) -> RequestGovernor {
    RequestGovernor::builder()
        .agent(agent)
        .storage(StorageRouter::new(dir.path().join("r"), dir.path().join("m")).unwrap())
        .retry(RetryConfig::disabled())
        .build()
        .unwrap()
}

fn request(message: &str) -> GovernedRequest {
    GovernedRequest::new(
        "10.1.1.1",
        "POST /api/v1/chat",
        AgentQuery::from_chat(&ChatRequest::new(message)),
    )
}

// ============================================================================
// Tests
// ============================================================================

/// Runs async code within a local recorder scope on the multi-thread runtime.
///
/// `block_in_place` ensures the sync `with_local_recorder` closure stays
/// on the current thread while `block_on` drives the inner async work.
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn successful_request_records_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let dir = tempfile::tempdir().unwrap();
    let governor = governor(Arc::new(OkAgent), &dir);

    let result = metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(governor.handle(request("hello")))
        })
    });
    assert!(result.is_ok());

    let snapshot = snapshotter.snapshot().into_vec();

    assert_eq!(
        counter_with_label(&snapshot, telemetry::REQUESTS_TOTAL, "status", "ok"),
        1
    );
    assert!(
        has_histogram(&snapshot, telemetry::REQUEST_DURATION_SECONDS),
        "expected a duration histogram entry"
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::RATE_LIMIT_DECISIONS_TOTAL, "decision", "allowed"),
        1
    );
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 1);
    assert!(counter_total(&snapshot, telemetry::TOKENS_ESTIMATED_TOTAL) > 0);
    assert_eq!(counter_total(&snapshot, telemetry::ERRORS_TOTAL), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn failed_request_records_error_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let dir = tempfile::tempdir().unwrap();
    let governor = governor(Arc::new(RejectingAgent), &dir);

    let result = metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(governor.handle(request("bad")))
        })
    });
    assert!(result.is_err());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::REQUESTS_TOTAL, "status", "error"),
        1
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::ERRORS_TOTAL, "kind", "upstream_permanent"),
        1
    );
}

#[test]
fn admission_decisions_are_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        let limiter = RateLimiter::new(RateLimitConfig::new().limits(2, 0.01));
        for _ in 0..3 {
            limiter.admit("k");
        }
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::RATE_LIMIT_DECISIONS_TOTAL, "decision", "allowed"),
        2
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::RATE_LIMIT_DECISIONS_TOTAL, "decision", "denied"),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn retries_are_counted_per_extra_attempt() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let executor = RetryExecutor::new(
        RetryConfig::new()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(1))
            .jitter(0.0),
    );

    let result: Result<()> = metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(
                executor.run("agent.invoke", || async {
                    Err(TollgateError::Network("reset".into()))
                }),
            )
        })
    });
    assert!(result.is_err());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::RETRIES_TOTAL, "operation", "agent.invoke"),
        2
    );
}

#[test]
fn collector_mirrors_to_facade() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let collector = MetricsCollector::new();
    metrics::with_local_recorder(&recorder, || {
        collector.record_request("GET /health", Duration::from_millis(3), Outcome::Success);
        collector.record_error("storage_failure");
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::REQUESTS_TOTAL, "endpoint", "GET /health"),
        1
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::ERRORS_TOTAL, "kind", "storage_failure"),
        1
    );

    // the collector's own view is independent of the recorder
    let own = collector.snapshot();
    assert_eq!(own.requests_total, 1);
    assert_eq!(own.errors_by_type["storage_failure"], 1);
    assert_eq!(own.errors_total, 0);
}

#[tokio::test]
async fn metrics_are_noop_without_recorder() {
    // Verify no panics when no recorder is installed.
    let dir = tempfile::tempdir().unwrap();
    let governor = governor(Arc::new(OkAgent), &dir);
    governor.handle(request("hello")).await.unwrap();
}
