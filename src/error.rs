//! Error taxonomy for the remote platform boundary.
//!
//! Every failure a platform adapter can produce is classified here so the
//! scheduler can apply policy by matching variants instead of parsing
//! messages.

use std::time::Duration;

use crate::model::Availability;

/// Why a video cannot be fetched right now (or ever).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    Private,
    Removed,
    MembersOnly,
    AgeGated,
}

impl UnavailableReason {
    /// The availability state recorded in the placeholder `metadata.json`.
    pub const fn availability(self) -> Availability {
        match self {
            Self::Private => Availability::Private,
            Self::Removed => Availability::Removed,
            // Age-gated content is still members-of-the-public content, but
            // it cannot be fetched anonymously; record it like members-only.
            Self::MembersOnly | Self::AgeGated => Availability::MembersOnly,
        }
    }
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Private => "private",
            Self::Removed => "removed",
            Self::MembersOnly => "members-only",
            Self::AgeGated => "age-gated",
        };
        f.write_str(s)
    }
}

/// All errors a [`crate::platform::VideoPlatform`] implementation may emit.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network hiccups, HTTP 5xx, timeouts. Retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// HTTP 429. `retry_after` is honored when the server provided one.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Daily API quota exhausted. Suspends the run via the quota manager.
    #[error("API quota exceeded")]
    QuotaExceeded,

    /// The resource exists but cannot be fetched. Recorded, never retried
    /// in incremental modes.
    #[error("unavailable: {reason}")]
    Unavailable { reason: UnavailableReason },

    /// The resource does not exist at all.
    #[error("not found")]
    NotFound,

    /// The platform answered with something we cannot interpret. Fatal for
    /// the affected item only.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether the per-item retry loop should try again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Classifies an HTTP status plus (optionally) the error body returned
    /// by the YouTube Data API. Quota exhaustion arrives as a 403 with a
    /// `quotaExceeded` reason, not as a 429.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Self::RateLimited { retry_after: None };
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            if body.contains("quotaExceeded") || body.contains("dailyLimitExceeded") {
                return Self::QuotaExceeded;
            }
            if body.contains("forbidden") && body.contains("private") {
                return Self::Unavailable {
                    reason: UnavailableReason::Private,
                };
            }
            return Self::Malformed(format!("HTTP 403: {}", snippet(body)));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Self::NotFound;
        }
        if status.is_server_error() {
            return Self::Transient(format!("HTTP {status}"));
        }
        Self::Malformed(format!("HTTP {status}: {}", snippet(body)))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::Transient(err.to_string());
        }
        if err.is_decode() {
            return Self::Malformed(err.to_string());
        }
        Self::Transient(err.to_string())
    }
}

/// Collapses an error body (often pretty-printed JSON) into one loggable
/// line. Callers match on substrings like `commentsDisabled`, so the body's
/// reason fields must survive.
fn snippet(body: &str) -> String {
    let mut flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() > 300 {
        let mut end = 300;
        while !flat.is_char_boundary(end) {
            end -= 1;
        }
        flat.truncate(end);
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn quota_exceeded_is_a_403_with_reason() {
        let err = FetchError::from_status(
            StatusCode::FORBIDDEN,
            r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#,
        );
        assert!(matches!(err, FetchError::QuotaExceeded));
    }

    #[test]
    fn too_many_requests_is_rate_limited() {
        let err = FetchError::from_status(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(err, FetchError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = FetchError::from_status(StatusCode::BAD_GATEWAY, "");
        assert!(matches!(err, FetchError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_and_malformed_are_terminal() {
        assert!(!FetchError::from_status(StatusCode::NOT_FOUND, "").is_retryable());
        assert!(!FetchError::from_status(StatusCode::BAD_REQUEST, "oops").is_retryable());
    }
}
