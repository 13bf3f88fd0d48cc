//! Telemetry metric name constants.
//!
//! Every outcome recorded by [`MetricsCollector`](crate::monitor::MetricsCollector)
//! and the governance components is also emitted through the `metrics`
//! facade. Consumers install their own recorder (e.g. prometheus, statsd);
//! without a recorder installed, all facade calls are no-ops and the
//! in-process snapshot remains the only view.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `tollgate_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `endpoint`: governed endpoint (e.g. "POST /api/v1/chat")
//! - `status`: outcome: "ok" or "error"
//! - `kind`: stable error kind (see [`TollgateError::kind`](crate::TollgateError::kind))
//! - `provider`: LLM provider the budget was checked against

/// Total governed requests.
///
/// Labels: `endpoint`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "tollgate_requests_total";

/// Governed request duration in seconds.
///
/// Labels: `endpoint`.
pub const REQUEST_DURATION_SECONDS: &str = "tollgate_request_duration_seconds";

/// Total errors by kind.
///
/// Labels: `kind`.
pub const ERRORS_TOTAL: &str = "tollgate_errors_total";

/// Requests currently inside the governor.
pub const IN_FLIGHT_REQUESTS: &str = "tollgate_in_flight_requests";

/// Admission decisions.
///
/// Labels: `decision` ("allowed" | "denied").
pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "tollgate_rate_limit_decisions_total";

/// Idle rate-limit buckets evicted by the sweeper.
pub const RATE_LIMIT_EVICTIONS_TOTAL: &str = "tollgate_rate_limit_evictions_total";

/// Total cache hits.
///
/// Labels: `category`.
pub const CACHE_HITS_TOTAL: &str = "tollgate_cache_hits_total";

/// Total cache misses, including misses caused by an unreachable backend.
///
/// Labels: `category`.
pub const CACHE_MISSES_TOTAL: &str = "tollgate_cache_misses_total";

/// Cache backend failures absorbed as misses.
pub const CACHE_BACKEND_ERRORS_TOTAL: &str = "tollgate_cache_backend_errors_total";

/// Retry attempts (not counting the initial call).
///
/// Labels: `operation`.
pub const RETRIES_TOTAL: &str = "tollgate_retries_total";

/// Requests rejected by the token budget.
///
/// Labels: `provider`.
pub const BUDGET_REJECTIONS_TOTAL: &str = "tollgate_budget_rejections_total";

/// Estimated tokens checked against the budget.
///
/// Labels: `provider`.
pub const TOKENS_ESTIMATED_TOTAL: &str = "tollgate_tokens_estimated_total";

/// Tokens reported as consumed by the provider after a call.
///
/// Labels: `provider`, `direction` ("input" | "output").
pub const TOKENS_CONSUMED_TOTAL: &str = "tollgate_tokens_consumed_total";

/// Artifact writes.
///
/// Labels: `category`, `status` ("ok" | "error").
pub const STORAGE_WRITES_TOTAL: &str = "tollgate_storage_writes_total";
