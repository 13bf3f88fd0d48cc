//! Tollgate error types

use std::time::Duration;

use crate::budget::BudgetRejection;

/// Tollgate error types
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    // Governance errors
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    AdmissionDenied {
        retry_after: Duration,
        limit: u32,
        remaining: u32,
    },

    #[error("{0}")]
    BudgetRejected(BudgetRejection),

    // Upstream errors (transient)
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream network error: {0}")]
    Network(String),

    #[error("upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("upstream rate limited, retry after {retry_after:?}")]
    UpstreamRateLimited { retry_after: Option<Duration> },

    // Upstream errors (permanent)
    #[error("upstream rejected request ({status}): {message}")]
    Permanent { status: u16, message: String },

    /// Retry budget spent; carries the last underlying error.
    #[error("upstream failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TollgateError>,
    },

    // Storage errors
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    /// Never user-visible; the cache degrades to a miss.
    #[error("cache backend unavailable: {0}")]
    CacheUnavailable(String),

    // Configuration / input errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TollgateError {
    /// Whether the error is worth retrying.
    ///
    /// Timeouts, network failures, 5xx responses and provider rate-limit
    /// signals are transient. Everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::UpstreamRateLimited { .. } => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::UpstreamRateLimited { retry_after } => *retry_after,
            Self::AdmissionDenied { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable identifier surfaced at the API boundary so clients can branch on it.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionDenied { .. } => "admission_denied",
            Self::BudgetRejected(_) => "budget_rejected",
            Self::Timeout(_)
            | Self::Network(_)
            | Self::Server { .. }
            | Self::UpstreamRateLimited { .. } => "upstream_transient",
            Self::Permanent { .. } => "upstream_permanent",
            Self::Exhausted { .. } => "upstream_exhausted",
            Self::Storage(_) => "storage_failure",
            Self::NotFound(_) => "not_found",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::Configuration(_) => "configuration",
            Self::InvalidInput(_) | Self::Json(_) => "invalid_input",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to show to end users.
    ///
    /// Contains no upstream payloads, paths or credentials. Budget rejections
    /// are the exception: their text is sizing guidance built from estimates.
    pub fn public_message(&self) -> String {
        match self {
            Self::AdmissionDenied { .. } => "Too many requests. Please try again later.".into(),
            Self::BudgetRejected(rejection) => rejection.to_string(),
            Self::Timeout(_)
            | Self::Network(_)
            | Self::Server { .. }
            | Self::UpstreamRateLimited { .. }
            | Self::Exhausted { .. } => {
                "The agent service is temporarily unavailable. Please try again later.".into()
            }
            Self::Permanent { .. } => "The agent service rejected the request.".into(),
            Self::Storage(_) => "Failed to store the result.".into(),
            Self::NotFound(_) => "The requested artifact does not exist.".into(),
            Self::InvalidInput(msg) => msg.clone(),
            Self::Json(_) => "Malformed request body.".into(),
            Self::CacheUnavailable(_) | Self::Configuration(_) | Self::Internal(_) => {
                "An unexpected error occurred. Please try again later.".into()
            }
        }
    }
}

impl From<std::io::Error> for TollgateError {
    fn from(err: std::io::Error) -> Self {
        TollgateError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for TollgateError {
    fn from(err: reqwest::Error) -> Self {
        // without the client's deadline at hand a timeout is reported as a
        // network failure; HttpAgentClient maps its own timeouts to `Timeout`
        if err.is_timeout() {
            TollgateError::Network(format!("request timed out: {err}"))
        } else if let Some(status) = err.status() {
            let status = status.as_u16();
            if status == 429 {
                TollgateError::UpstreamRateLimited { retry_after: None }
            } else if status >= 500 {
                TollgateError::Server {
                    status,
                    message: err.to_string(),
                }
            } else {
                TollgateError::Permanent {
                    status,
                    message: err.to_string(),
                }
            }
        } else if err.is_decode() {
            TollgateError::Permanent {
                status: 200,
                message: format!("undecodable response: {err}"),
            }
        } else {
            TollgateError::Network(err.to_string())
        }
    }
}

/// Result type alias for Tollgate operations
pub type Result<T> = std::result::Result<T, TollgateError>;
