//! Mapping from [`TollgateError`] to HTTP responses.

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::TollgateError;
use crate::budget::RejectAdvice;

pub(crate) const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub(crate) const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub(crate) const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Whole seconds, rounded up so clients never retry early.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}

pub(crate) fn insert_rate_limit_headers(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    reset: Duration,
) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(ceil_secs(reset)));
}

/// Error returned from HTTP handlers.
///
/// The body is always `{"error": <kind>, "message": <public message>}`;
/// internal details are logged, never echoed.
#[derive(Debug)]
pub struct ApiError(pub TollgateError);

impl From<TollgateError> for ApiError {
    fn from(err: TollgateError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TollgateError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            TollgateError::BudgetRejected(_) => StatusCode::PAYLOAD_TOO_LARGE,
            TollgateError::Exhausted { .. } => StatusCode::BAD_GATEWAY,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            TollgateError::Permanent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            TollgateError::NotFound(_) => StatusCode::NOT_FOUND,
            TollgateError::InvalidInput(_) | TollgateError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), error = %self.0, "request rejected");
        }

        let mut body = json!({
            "error": self.0.kind(),
            "message": self.0.public_message(),
        });
        let mut headers = HeaderMap::new();

        match &self.0 {
            TollgateError::AdmissionDenied {
                retry_after,
                limit,
                remaining,
            } => {
                insert_rate_limit_headers(&mut headers, *limit, *remaining, *retry_after);
                headers.insert(
                    axum::http::header::RETRY_AFTER,
                    HeaderValue::from(ceil_secs(*retry_after)),
                );
                body["retry_after"] = json!(ceil_secs(*retry_after));
            }
            TollgateError::BudgetRejected(rejection) => {
                body["estimated_tokens"] = json!(rejection.estimated);
                body["max_tokens"] = json!(rejection.ceiling);
                if let RejectAdvice::Truncate { reduce_by, .. } = rejection.advice {
                    body["reduce_by"] = json!(reduce_by);
                }
            }
            _ => {}
        }

        (status, headers, Json(body)).into_response()
    }
}
