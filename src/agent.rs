//! The external agent collaborator.
//!
//! Agent reasoning, tool use and sub-agent delegation all live behind
//! [`AgentInvoker`]. Only [`RequestGovernor`](crate::governor::RequestGovernor)
//! calls it, always under the rate limiter, budget and retry policy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

use crate::types::{AgentQuery, AgentResult};
use crate::{Result, TollgateError};

/// Default per-request timeout for the HTTP agent.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound for reachability checks.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque asynchronous agent call.
///
/// Implementations must report failures through the transient/permanent
/// variants of [`TollgateError`] so the retry policy can classify them.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Name for logs and health output.
    fn name(&self) -> &str;

    /// Run one query to completion.
    async fn invoke(&self, query: &AgentQuery) -> Result<AgentResult>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Agent runtime reached over HTTP.
///
/// Sends the query as JSON to `{base_url}/invoke` and expects an
/// [`AgentResult`] back.
#[derive(Clone)]
pub struct HttpAgentClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TollgateError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check response status and map to the error taxonomy.
    fn handle_response_errors(response: &reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        match status.as_u16() {
            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| parse_retry_after(s, Utc::now()));
                Err(TollgateError::UpstreamRateLimited { retry_after })
            }
            code if code >= 500 => Err(TollgateError::Server {
                status: code,
                message: format!("agent returned {status}"),
            }),
            code => Err(TollgateError::Permanent {
                status: code,
                message: format!("agent returned {status}"),
            }),
        }
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, query: &AgentQuery) -> Result<AgentResult> {
        let response = self
            .http
            .post(format!("{}/invoke", self.base_url))
            .json(query)
            .send()
            .await
            .map_err(|e| upstream_error(e, self.timeout))?;
        Self::handle_response_errors(&response)?;
        response
            .json::<AgentResult>()
            .await
            .map_err(|e| upstream_error(e, self.timeout))
    }

    /// Reachable when the runtime answers at all; the status is not checked.
    async fn ping(&self) -> Result<()> {
        self.http
            .get(format!("{}/health", self.base_url))
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| upstream_error(e, PING_TIMEOUT))?;
        Ok(())
    }
}

/// Map a transport error, reporting timeouts with the deadline that elapsed.
fn upstream_error(err: reqwest::Error, timeout: Duration) -> TollgateError {
    if err.is_timeout() {
        TollgateError::Timeout(timeout)
    } else {
        err.into()
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// A date in the past yields a zero delay.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        at.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_retry_after(" 12 ", now), Some(Duration::from_secs(12)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = HttpAgentClient::new("http://localhost:2024/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:2024");
    }
}
