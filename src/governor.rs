//! Request governance facade.
//!
//! [`RequestGovernor`] is the only component that calls the agent. Every
//! request moves through a fixed sequence of states:
//!
//! ```text
//! Admitted -> CacheChecked -> CacheHit -> Served
//!                          -> CacheMiss -> BudgetChecked -> Rejected
//!                                                        -> Retrying -> Succeeded -> Served
//!                                                                    -> Exhausted -> Failed
//! ```
//!
//! A request that fails admission ends in `Denied` without entering the
//! machine. Transitions are logged at `debug` inside the request span.
//!
//! The upstream leg (retries, cache store, persistence, usage accounting)
//! runs as its own task. If the caller goes away mid-request, that task
//! still completes and caches its result, while the caller's in-flight
//! accounting is released immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentInvoker;
use crate::budget::{BudgetConfig, TokenBudget, TokenBudgetManager, TokenEstimator};
use crate::cache::{CacheBackend, CacheConfig, CacheKey, CacheLookup, ResponseCache};
use crate::config::Config;
use crate::monitor::{MetricsCollector, Outcome};
use crate::ratelimit::{Admission, RateLimitConfig, RateLimitInfo, RateLimiter};
use crate::retry::{RetryAttempt, RetryConfig, RetryExecutor};
use crate::storage::{Category, StorageRecord, StorageRouter};
use crate::telemetry;
use crate::types::{AgentQuery, AgentResult};
use crate::{Result, TollgateError};

/// Cache category for agent responses.
pub const AGENT_CACHE_CATEGORY: &str = "agent";

/// Lifecycle state of a governed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Denied,
    Admitted,
    CacheChecked,
    CacheHit,
    CacheMiss,
    BudgetChecked,
    Rejected,
    Retrying,
    Succeeded,
    Exhausted,
    Served,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Denied => "denied",
            RequestState::Admitted => "admitted",
            RequestState::CacheChecked => "cache_checked",
            RequestState::CacheHit => "cache_hit",
            RequestState::CacheMiss => "cache_miss",
            RequestState::BudgetChecked => "budget_checked",
            RequestState::Rejected => "rejected",
            RequestState::Retrying => "retrying",
            RequestState::Succeeded => "succeeded",
            RequestState::Exhausted => "exhausted",
            RequestState::Served => "served",
            RequestState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Denied | RequestState::Rejected | RequestState::Served | RequestState::Failed
        )
    }
}

fn enter(state: RequestState) {
    debug!(state = state.as_str(), terminal = state.is_terminal(), "request state");
}

/// One inbound request to govern.
#[derive(Debug, Clone)]
pub struct GovernedRequest {
    /// Rate-limit key, usually the source IP.
    pub client_key: String,
    /// Endpoint label for metrics (e.g. `POST /api/v1/chat`).
    pub endpoint: String,
    /// Provider whose budget applies; the governor default when `None`.
    pub provider: Option<String>,
    pub query: AgentQuery,
    /// Artifact categories to persist on success.
    pub persist: HashSet<Category>,
    pub cacheable: bool,
    /// Overall deadline for the request; elapsing it fails with
    /// [`TollgateError::Timeout`]. The upstream call itself keeps running.
    pub deadline: Option<Duration>,
}

impl GovernedRequest {
    pub fn new(client_key: impl Into<String>, endpoint: impl Into<String>, query: AgentQuery) -> Self {
        Self {
            client_key: client_key.into(),
            endpoint: endpoint.into(),
            provider: None,
            query,
            persist: HashSet::new(),
            cacheable: true,
            deadline: None,
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn persist(mut self, category: Category) -> Self {
        self.persist.insert(category);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Upstream,
}

/// An artifact that could not be written.
#[derive(Debug)]
pub struct PersistFailure {
    pub category: Category,
    pub logical_id: String,
    pub error: TollgateError,
}

/// Successful outcome of [`RequestGovernor::handle`].
#[derive(Debug)]
pub struct GovernedResponse {
    pub result: AgentResult,
    pub thread_id: String,
    pub source: ResponseSource,
    /// Limiter state after this request's admission.
    pub rate_limit: RateLimitInfo,
    /// `None` for cache hits.
    pub budget: Option<TokenBudget>,
    pub attempts: Vec<RetryAttempt>,
    pub persisted: Vec<StorageRecord>,
    /// Storage errors do not fail the request; they are reported here.
    pub persist_failures: Vec<PersistFailure>,
}

/// Overall service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Reachability of a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Connected,
    Disconnected,
}

impl From<bool> for Connectivity {
    fn from(up: bool) -> Self {
        if up {
            Connectivity::Connected
        } else {
            Connectivity::Disconnected
        }
    }
}

/// Body of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub cache_backend: Connectivity,
    pub agent: Connectivity,
    pub timestamp: DateTime<Utc>,
}

/// Keeps the in-flight gauge accurate even when a request is cancelled.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::gauge!(telemetry::IN_FLIGHT_REQUESTS).increment(1.0);
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::gauge!(telemetry::IN_FLIGHT_REQUESTS).decrement(1.0);
    }
}

/// Composes admission, caching, budgeting, retries, persistence and metrics
/// around the agent.
pub struct RequestGovernor {
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    budget: Arc<TokenBudgetManager>,
    retry: RetryExecutor,
    storage: Arc<StorageRouter>,
    metrics: Arc<MetricsCollector>,
    agent: Arc<dyn AgentInvoker>,
    provider: String,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl RequestGovernor {
    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::new()
    }

    /// Build a governor from validated configuration and an agent.
    pub fn from_config(config: &Config, agent: Arc<dyn AgentInvoker>) -> Result<Self> {
        GovernorBuilder::from_config(config)?.agent(agent).build()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn budget(&self) -> &TokenBudgetManager {
        &self.budget
    }

    pub fn storage(&self) -> &StorageRouter {
        &self.storage
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Default provider for budget checks.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Start background maintenance. Requires a tokio runtime.
    pub fn start(&self) {
        let handle = self.limiter.spawn_sweeper();
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        info!(
            provider = %self.provider,
            cache_backend = self.cache.backend_name(),
            agent = self.agent.name(),
            "request governor started"
        );
    }

    /// Stop background work and flush a final metrics summary to the log.
    ///
    /// Health reports `unhealthy` from here on so load balancers drain the
    /// instance.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let snapshot = self.metrics.snapshot();
        info!(
            requests = snapshot.requests_total,
            errors = snapshot.errors_total,
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            rate_limit_denials = snapshot.rate_limit_denials,
            "request governor stopped"
        );
    }

    pub async fn health(&self) -> HealthReport {
        let (cache_up, agent_up) = tokio::join!(self.cache.is_available(), async {
            self.agent.ping().await.is_ok()
        });
        let status = if self.shutting_down.load(Ordering::SeqCst) || !agent_up {
            HealthStatus::Unhealthy
        } else if !cache_up {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            cache_backend: cache_up.into(),
            agent: agent_up.into(),
            timestamp: Utc::now(),
        }
    }

    /// Govern one request end to end.
    ///
    /// Exactly one request record (and, on failure, one error record) is
    /// written to the metrics collector regardless of how many upstream
    /// attempts were made.
    #[instrument(skip(self, request), fields(
        endpoint = %request.endpoint,
        client = %request.client_key,
        thread = %request.query.thread_id
    ))]
    pub async fn handle(&self, request: GovernedRequest) -> Result<GovernedResponse> {
        let start = Instant::now();
        let _in_flight = InFlight::enter();
        let endpoint = request.endpoint.clone();

        let result = match request.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.govern(request))
                .await
                .unwrap_or(Err(TollgateError::Timeout(deadline))),
            None => self.govern(request).await,
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) => {
                self.metrics.record_error(e.kind());
                Outcome::Failure
            }
        };
        self.metrics.record_request(&endpoint, start.elapsed(), outcome);
        result
    }

    async fn govern(&self, request: GovernedRequest) -> Result<GovernedResponse> {
        let GovernedRequest {
            client_key,
            provider,
            query,
            persist,
            cacheable,
            ..
        } = request;

        let admission = self.limiter.admit(&client_key);
        self.metrics.record_rate_limit(admission.is_allowed());
        let rate_limit = match admission {
            Admission::Allowed(info) => info,
            Admission::Denied { info, retry_after } => {
                enter(RequestState::Denied);
                return Err(TollgateError::AdmissionDenied {
                    retry_after,
                    limit: info.limit,
                    remaining: info.remaining,
                });
            }
        };
        enter(RequestState::Admitted);

        let key = cacheable.then(|| CacheKey::new(AGENT_CACHE_CATEGORY, &query.cache_args()));
        if let Some(key) = &key {
            let lookup = self.cache.lookup(key).await;
            enter(RequestState::CacheChecked);
            if let CacheLookup::Hit(value) = lookup {
                match serde_json::from_value::<AgentResult>(value) {
                    Ok(result) => {
                        self.metrics.record_cache_outcome(true);
                        enter(RequestState::CacheHit);
                        enter(RequestState::Served);
                        return Ok(GovernedResponse {
                            result,
                            thread_id: query.thread_id,
                            source: ResponseSource::Cache,
                            rate_limit,
                            budget: None,
                            attempts: Vec::new(),
                            persisted: Vec::new(),
                            persist_failures: Vec::new(),
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "discarding undecodable cache entry");
                        self.cache.invalidate(key).await;
                    }
                }
            }
            self.metrics.record_cache_outcome(false);
            enter(RequestState::CacheMiss);
        }

        let provider = provider.unwrap_or_else(|| self.provider.clone());
        let estimate = self.budget.estimate_request(
            &query.message,
            query.user_name.as_deref(),
            query.continues_thread.then_some(query.thread_id.as_str()),
        );
        let budget = match self
            .budget
            .reserve(uuid::Uuid::new_v4().to_string(), &provider, &estimate)
        {
            Ok(budget) => budget,
            Err(rejection) => {
                enter(RequestState::Rejected);
                return Err(TollgateError::BudgetRejected(rejection));
            }
        };
        enter(RequestState::BudgetChecked);

        let upstream = Upstream {
            agent: Arc::clone(&self.agent),
            retry: self.retry.clone(),
            cache: Arc::clone(&self.cache),
            storage: Arc::clone(&self.storage),
            metrics: Arc::clone(&self.metrics),
        };
        let thread_id = query.thread_id.clone();
        // Not aborted on drop; the call completes even if the caller leaves.
        let task = tokio::spawn(upstream.run(query, key, persist, budget));
        let done = task
            .await
            .map_err(|e| TollgateError::Internal(format!("upstream task failed: {e}")))??;

        enter(RequestState::Served);
        Ok(GovernedResponse {
            result: done.result,
            thread_id,
            source: ResponseSource::Upstream,
            rate_limit,
            budget: Some(done.budget),
            attempts: done.attempts,
            persisted: done.persisted,
            persist_failures: done.persist_failures,
        })
    }
}

struct UpstreamDone {
    result: AgentResult,
    budget: TokenBudget,
    attempts: Vec<RetryAttempt>,
    persisted: Vec<StorageRecord>,
    persist_failures: Vec<PersistFailure>,
}

/// Owned handles for the detached upstream leg.
struct Upstream {
    agent: Arc<dyn AgentInvoker>,
    retry: RetryExecutor,
    cache: Arc<ResponseCache>,
    storage: Arc<StorageRouter>,
    metrics: Arc<MetricsCollector>,
}

impl Upstream {
    async fn run(
        self,
        query: AgentQuery,
        key: Option<CacheKey>,
        persist: HashSet<Category>,
        mut budget: TokenBudget,
    ) -> Result<UpstreamDone> {
        enter(RequestState::Retrying);
        let agent = &self.agent;
        let retried = self
            .retry
            .run_traced("agent.invoke", || agent.invoke(&query))
            .await;

        let result = match retried.result {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, TollgateError::Exhausted { .. }) {
                    enter(RequestState::Exhausted);
                }
                enter(RequestState::Failed);
                return Err(e);
            }
        };
        enter(RequestState::Succeeded);

        if let Some(key) = &key {
            match serde_json::to_value(&result) {
                Ok(value) => self.cache.store(key, value, None).await,
                Err(e) => debug!(error = %e, "agent result not cacheable"),
            }
        }

        if let Some(usage) = result.usage {
            budget.record_consumed(usage.input_tokens, usage.output_tokens);
        }

        let mut persisted = Vec::new();
        let mut persist_failures = Vec::new();
        for artifact in result
            .artifacts
            .iter()
            .filter(|a| persist.contains(&a.category))
        {
            match self
                .storage
                .persist(
                    artifact.category,
                    &artifact.logical_id,
                    artifact.format,
                    artifact.content.as_str(),
                )
                .await
            {
                Ok(record) => persisted.push(record),
                Err(error) => {
                    warn!(
                        category = artifact.category.as_str(),
                        id = %artifact.logical_id,
                        error = %error,
                        "failed to persist artifact"
                    );
                    self.metrics.record_error(error.kind());
                    persist_failures.push(PersistFailure {
                        category: artifact.category,
                        logical_id: artifact.logical_id.clone(),
                        error,
                    });
                }
            }
        }

        Ok(UpstreamDone {
            result,
            budget,
            attempts: retried.attempts,
            persisted,
            persist_failures,
        })
    }
}

/// Assembles a [`RequestGovernor`] from its parts.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use tollgate::{HttpAgentClient, RequestGovernor, StorageRouter, RetryConfig};
/// # fn main() -> tollgate::Result<()> {
/// let governor = RequestGovernor::builder()
///     .agent(Arc::new(HttpAgentClient::new("http://localhost:2024")?))
///     .storage(StorageRouter::new("/var/lib/tollgate/reports", "/var/lib/tollgate/memories")?)
///     .retry(RetryConfig::new().max_attempts(4))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct GovernorBuilder {
    rate_limit: RateLimitConfig,
    cache: CacheConfig,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    budget: BudgetConfig,
    estimator: Option<Box<dyn TokenEstimator>>,
    retry: RetryConfig,
    storage: Option<StorageRouter>,
    metrics: Option<Arc<MetricsCollector>>,
    agent: Option<Arc<dyn AgentInvoker>>,
    provider: String,
}

impl Default for GovernorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernorBuilder {
    pub fn new() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            cache_backend: None,
            budget: BudgetConfig::default(),
            estimator: None,
            retry: RetryConfig::default(),
            storage: None,
            metrics: None,
            agent: None,
            provider: crate::config::DEFAULT_PROVIDER.to_owned(),
        }
    }

    /// Seed every component setting from configuration.
    ///
    /// The agent is not created here so callers can substitute their own.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new()
            .rate_limit(config.rate_limit_config())
            .cache(config.cache_config())
            .budget(config.budget_config())
            .retry(config.retry_config())
            .storage(config.storage_router()?)
            .provider(config.agent.provider.clone()))
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Use a custom cache backend instead of the in-memory one.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn budget(mut self, config: BudgetConfig) -> Self {
        self.budget = config;
        self
    }

    pub fn estimator(mut self, estimator: Box<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn storage(mut self, storage: StorageRouter) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Share an existing collector (e.g. with the HTTP layer).
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn agent(mut self, agent: Arc<dyn AgentInvoker>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn build(self) -> Result<RequestGovernor> {
        let agent = self
            .agent
            .ok_or_else(|| TollgateError::Configuration("no agent configured".into()))?;
        let storage = self
            .storage
            .ok_or_else(|| TollgateError::Configuration("no storage roots configured".into()))?;
        let cache = match self.cache_backend {
            Some(backend) => ResponseCache::with_backend(self.cache, backend),
            None => ResponseCache::new(self.cache),
        };
        let budget = match self.estimator {
            Some(estimator) => TokenBudgetManager::with_estimator(self.budget, estimator),
            None => TokenBudgetManager::new(self.budget),
        };

        Ok(RequestGovernor {
            limiter: Arc::new(RateLimiter::new(self.rate_limit)),
            cache: Arc::new(cache),
            budget: Arc::new(budget),
            retry: RetryExecutor::new(self.retry),
            storage: Arc::new(storage),
            metrics: self.metrics.unwrap_or_default(),
            agent,
            provider: self.provider,
            sweeper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RequestState::Served.is_terminal());
        assert!(RequestState::Denied.is_terminal());
        assert!(!RequestState::Retrying.is_terminal());
        assert!(!RequestState::CacheMiss.is_terminal());
    }

    #[test]
    fn builder_requires_agent_and_storage() {
        let err = GovernorBuilder::new().build().err().unwrap();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn health_serializes_camel_case() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            cache_backend: Connectivity::Disconnected,
            agent: Connectivity::Connected,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["cacheBackend"], "disconnected");
    }
}
