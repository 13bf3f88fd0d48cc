//! Retry configuration, delay calculation, and the retry executor.
//!
//! [`RetryExecutor`] wraps any outbound call with bounded retries on
//! transient errors (as classified by [`TollgateError::is_transient()`]).
//! Permanent errors propagate immediately without consuming retry budget.
//!
//! Attempts for one call are strictly sequential. Each attempt may carry a
//! deadline; overrunning it counts as a transient failure, so on the final
//! attempt it surfaces as [`TollgateError::Exhausted`].
//!
//! Callers are responsible for the idempotency of what they pass in.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::telemetry;
use crate::{Result, TollgateError};

/// Configuration for retry behaviour on transient errors.
///
/// Uses exponential backoff with proportional jitter:
///
/// ```rust
/// # use tollgate::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200))
///     .multiplier(2.0)
///     .jitter(0.2);
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial call).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 1s.
    pub initial_delay: Duration,
    /// Growth factor applied per retry. Default: 2.0.
    pub multiplier: f64,
    /// Maximum delay between retries (caps exponential growth). Default: 60s.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay, in `[0, 1]`. Default: 0.1.
    pub jitter: f64,
    /// Deadline for each individual attempt. Default: none.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial call).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the exponential growth factor.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter fraction (0 disables jitter).
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction;
        self
    }

    /// Set a per-attempt deadline.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Delay before retry number `retry` (0-indexed), without jitter.
    ///
    /// `min(max_delay, initial_delay * multiplier^retry)`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Apply `±jitter` to a delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let fraction = self.jitter.clamp(0.0, 1.0);
        if fraction == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-fraction..=fraction);
        delay.mul_f64(factor.max(0.0))
    }

    /// Full delay calculation, respecting provider `retry_after` hints.
    ///
    /// A hint from an upstream rate-limit response takes precedence over the
    /// computed backoff, capped at `max_delay`.
    pub fn effective_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.jittered(self.delay_for_attempt(retry)),
        }
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Transient failure, identified by error kind.
    Transient(&'static str),
    /// Permanent failure; no further attempts.
    Permanent(&'static str),
}

/// Record of one attempt made by [`RetryExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Delay slept before this attempt (zero for the first).
    pub delay_before: Duration,
    pub outcome: AttemptOutcome,
}

/// Result of a retried call plus its attempt history.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T>,
    pub attempts: Vec<RetryAttempt>,
}

/// Runs operations under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `f` with retry, returning the result only.
    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_traced(operation, f).await.result
    }

    /// Execute `f` with retry, returning the result and attempt history.
    ///
    /// After `max_attempts` transient failures the result is
    /// [`TollgateError::Exhausted`] carrying the last underlying error.
    pub async fn run_traced<F, Fut, T>(&self, operation: &str, mut f: F) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);
        let mut delay_before = Duration::ZERO;
        let mut last_err = None;

        for attempt in 0..max_attempts {
            let outcome = match self.config.attempt_timeout {
                Some(deadline) => match tokio::time::timeout(deadline, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(TollgateError::Timeout(deadline)),
                },
                None => f().await,
            };

            match outcome {
                Ok(value) => {
                    attempts.push(RetryAttempt {
                        attempt_number: attempt + 1,
                        delay_before,
                        outcome: AttemptOutcome::Success,
                    });
                    return Retried {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() => {
                    attempts.push(RetryAttempt {
                        attempt_number: attempt + 1,
                        delay_before,
                        outcome: AttemptOutcome::Transient(e.kind()),
                    });
                    if attempt + 1 < max_attempts {
                        metrics::counter!(telemetry::RETRIES_TOTAL,
                            "operation" => operation.to_owned(),
                        )
                        .increment(1);
                        delay_before = self.config.effective_delay(attempt, e.retry_after());
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay_before.as_millis() as u64,
                            error = %e,
                            "retrying after transient error"
                        );
                        tokio::time::sleep(delay_before).await;
                    }
                    last_err = Some(e);
                }
                Err(e) => {
                    // permanent error, no retry
                    attempts.push(RetryAttempt {
                        attempt_number: attempt + 1,
                        delay_before,
                        outcome: AttemptOutcome::Permanent(e.kind()),
                    });
                    return Retried {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }

        let last = last_err.unwrap_or_else(|| TollgateError::Internal("no attempt made".into()));
        Retried {
            result: Err(TollgateError::Exhausted {
                attempts: max_attempts,
                last: Box::new(last),
            }),
            attempts,
        }
    }
}
