//! Upstream failure classification
//!
//! Every upstream failure carries a kind that decides what happens to the
//! account that hit it: rate limits start a cooldown, auth failures force a
//! re-login, transient failures are worth retrying on another account, and
//! fatal failures are surfaced to the caller unchanged because no account
//! would fare better with the same request.

use thiserror::Error;

/// Maximum number of characters of an upstream error body carried in an
/// error detail. Bodies can be arbitrarily large HTML error pages.
const DETAIL_LIMIT: usize = 160;

/// How a failure should drive account handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 429: the account hit its limit; cool it down and fail over
    RateLimited,
    /// 401/403: the session is dead; re-login before the next use
    Auth,
    /// Timeouts, connect failures, 5xx: likely to succeed elsewhere
    Transient,
    /// Malformed request or policy rejection: retrying burns accounts for nothing
    Fatal,
}

impl ErrorKind {
    /// Stable lowercase label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Auth => "auth",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Errors from upstream calls. Variants mirror [`ErrorKind`]; payloads are
/// human-readable details that never contain credentials or tokens.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("session rejected: {0}")]
    Auth(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("request rejected: {0}")]
    Fatal(String),
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::RateLimited(_) => ErrorKind::RateLimited,
            UpstreamError::Auth(_) => ErrorKind::Auth,
            UpstreamError::Transient(_) => ErrorKind::Transient,
            UpstreamError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether another account is worth trying for the same request.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Fatal)
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("{status}: {}", truncate_detail(body));
        match classify_status(status) {
            ErrorKind::RateLimited => UpstreamError::RateLimited(detail),
            ErrorKind::Auth => UpstreamError::Auth(detail),
            ErrorKind::Transient => UpstreamError::Transient(detail),
            ErrorKind::Fatal => UpstreamError::Fatal(detail),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Transient("request timed out".into())
        } else if err.is_connect() {
            UpstreamError::Transient(format!("connect failed: {err}"))
        } else {
            UpstreamError::Transient(format!("request failed: {err}"))
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Classify an upstream HTTP status.
///
/// 429 is a rate limit, 401/403 kill the session, 408 and 5xx are transient.
/// Every other 4xx is the request's own fault and not retryable.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        401 | 403 => ErrorKind::Auth,
        408 => ErrorKind::Transient,
        400..=499 => ErrorKind::Fatal,
        _ => ErrorKind::Transient,
    }
}

/// Clamp an error body to something loggable.
fn truncate_detail(body: &str) -> String {
    if body.is_empty() {
        return String::from("<no body>");
    }
    body.chars().take(DETAIL_LIMIT).collect()
}
