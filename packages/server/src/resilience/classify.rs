//! Error classification for generation and publishing API failures.
//!
//! Raw failures from the API clients carry whatever the transport gave us
//! (HTTP status, vendor error code, message, optional Retry-After). This
//! module maps them once into a closed [`ClassifiedError`] that the rest of
//! the resilience stack consumes; nothing downstream pokes at raw fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A raw failure descriptor as produced by an API client.
///
/// `http_status` of `None` or `0` means the request never got a response
/// (DNS failure, connection reset, client-side timeout).
#[derive(Debug, Clone, Default, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RawFailure {
    pub http_status: Option<u16>,
    pub vendor_code: Option<String>,
    pub message: String,
    /// Server-suggested delay, from a Retry-After header or error body.
    pub retry_after_ms: Option<u64>,
}

impl RawFailure {
    pub fn new(http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            vendor_code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.vendor_code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(delay.as_millis() as u64);
        self
    }
}

/// Closed taxonomy of failure categories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "error_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    Validation,
    ContentPolicy,
    Model,
    Network,
    Timeout,
    Server,
    Unknown,
}

impl ErrorCategory {
    /// Whether a failure in this category may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorCategory::RateLimit
            | ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Server
            | ErrorCategory::Unknown => true,
            ErrorCategory::Auth
            | ErrorCategory::Validation
            | ErrorCategory::ContentPolicy
            | ErrorCategory::Model => false,
        }
    }

    /// Whether failures in this category count toward tripping a circuit
    /// breaker. Caller errors never indicate dependency unavailability.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Server | ErrorCategory::Network | ErrorCategory::Timeout
        )
    }

    /// Human-readable summary surfaced in HTTP responses. Never includes
    /// vendor payloads.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Auth => "authentication with the upstream service failed",
            ErrorCategory::RateLimit => "the upstream service is rate limiting requests",
            ErrorCategory::Validation => "the request was rejected as invalid",
            ErrorCategory::ContentPolicy => "the content was rejected by upstream policy",
            ErrorCategory::Model => "the requested model is not available",
            ErrorCategory::Network => "a network error occurred reaching the upstream service",
            ErrorCategory::Timeout => "the upstream service timed out",
            ErrorCategory::Server => "the upstream service returned an internal error",
            ErrorCategory::Unknown => "an unrecognized upstream error occurred",
        }
    }
}

/// A classified failure: the single error type consumed by the retry
/// policy, circuit breakers, tracker and HTTP handlers.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{}: {message}", category.user_message())]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub http_status: Option<u16>,
    pub vendor_code: Option<String>,
    /// Server-suggested retry delay (rate-limit responses).
    pub retry_after_ms: Option<u64>,
    pub message: String,
}

impl ClassifiedError {
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Vendor codes that indicate a content-policy rejection on a 400.
const CONTENT_POLICY_CODES: &[&str] = &[
    "content_policy_violation",
    "content_filter",
    "moderation_blocked",
];

/// Vendor codes that indicate the requested model does not exist.
const MODEL_NOT_FOUND_CODES: &[&str] = &["model_not_found", "unknown_model"];

/// Map a raw failure into the closed taxonomy.
pub fn classify(raw: &RawFailure) -> ClassifiedError {
    let code = raw.vendor_code.as_deref().unwrap_or("");
    let lower = raw.message.to_lowercase();

    let category = match raw.http_status {
        Some(401) | Some(403) => ErrorCategory::Auth,
        Some(429) => ErrorCategory::RateLimit,
        Some(400) if CONTENT_POLICY_CODES.contains(&code) => ErrorCategory::ContentPolicy,
        Some(400) => ErrorCategory::Validation,
        Some(404) if MODEL_NOT_FOUND_CODES.contains(&code) || lower.contains("model") => {
            ErrorCategory::Model
        }
        Some(status) if status >= 500 => ErrorCategory::Server,
        None | Some(0) => {
            if lower.contains("timed out") || lower.contains("timeout") || lower.contains("etimedout")
            {
                ErrorCategory::Timeout
            } else if lower.contains("econnreset")
                || lower.contains("connection reset")
                || lower.contains("connection refused")
                || lower.contains("dns")
            {
                ErrorCategory::Network
            } else {
                // No response and no recognizable cause: assume transient.
                ErrorCategory::Network
            }
        }
        _ => ErrorCategory::Unknown,
    };

    ClassifiedError {
        category,
        http_status: raw.http_status,
        vendor_code: raw.vendor_code.clone(),
        retry_after_ms: raw.retry_after_ms,
        message: raw.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_status(status: u16) -> ClassifiedError {
        classify(&RawFailure::new(Some(status), "boom"))
    }

    #[test]
    fn auth_statuses_are_non_retryable() {
        for status in [401, 403] {
            let err = classify_status(status);
            assert_eq!(err.category, ErrorCategory::Auth);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn rate_limit_preserves_server_delay() {
        let raw = RawFailure::new(Some(429), "slow down")
            .with_retry_after(Duration::from_secs(12));
        let err = classify(&raw);
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn bad_request_with_policy_code_is_content_policy() {
        let raw = RawFailure::new(Some(400), "rejected").with_code("content_policy_violation");
        let err = classify(&raw);
        assert_eq!(err.category, ErrorCategory::ContentPolicy);
        assert!(!err.is_retryable());
    }

    #[test]
    fn plain_bad_request_is_validation() {
        let err = classify_status(400);
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_model_is_non_retryable() {
        let raw = RawFailure::new(Some(404), "not found").with_code("model_not_found");
        let err = classify(&raw);
        assert_eq!(err.category, ErrorCategory::Model);
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in [500, 502, 503, 504] {
            let err = classify_status(status);
            assert_eq!(err.category, ErrorCategory::Server);
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn connection_reset_is_network() {
        let err = classify(&RawFailure::new(None, "ECONNRESET while reading body"));
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn timed_out_is_timeout() {
        let err = classify(&RawFailure::new(Some(0), "operation timed out"));
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn unrecognized_status_is_unknown_and_retryable() {
        let err = classify_status(418);
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert!(err.is_retryable());
    }

    #[test]
    fn only_dependency_failures_trip_the_breaker() {
        assert!(ErrorCategory::Server.trips_breaker());
        assert!(ErrorCategory::Network.trips_breaker());
        assert!(ErrorCategory::Timeout.trips_breaker());
        assert!(!ErrorCategory::Auth.trips_breaker());
        assert!(!ErrorCategory::Validation.trips_breaker());
        assert!(!ErrorCategory::RateLimit.trips_breaker());
    }
}
