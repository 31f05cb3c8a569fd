//! Gateway error types and their HTTP mapping
//!
//! Per-request failures end up as JSON error bodies built in the API layer;
//! this module decides status codes and stable error type labels. Pool and
//! upstream errors convert via `From`, so handlers can use `?` and map once
//! at the edge.

use axum::http::StatusCode;
use thiserror::Error;
use upstream::UpstreamError;

#[derive(Error, Debug)]
pub enum Error {
    /// Every eligible account was tried or excluded; carries the most recent
    /// attempt failure so the caller sees why.
    #[error("no healthy account available: {last_failure}")]
    NoHealthyAccounts { last_failure: String },

    /// The stream failed after output was already delivered. Not retried.
    #[error("response truncated mid-stream: {0}")]
    TruncatedStream(String),

    /// The upstream rejected the request itself; switching accounts would
    /// not change the answer.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Pool(#[from] account_pool::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status for the JSON error body.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NoHealthyAccounts { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::TruncatedStream(_) => StatusCode::BAD_GATEWAY,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Pool(err) => match err {
                account_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
                account_pool::Error::DuplicateAccount(_) => StatusCode::CONFLICT,
                account_pool::Error::InvalidTransition { .. } => StatusCode::CONFLICT,
                account_pool::Error::LoginInProgress(_) => StatusCode::CONFLICT,
                account_pool::Error::AccountDisabled(_) => StatusCode::CONFLICT,
                account_pool::Error::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                account_pool::Error::LoginFailed { .. } => StatusCode::BAD_GATEWAY,
                account_pool::Error::CorruptSnapshot(_) | account_pool::Error::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// Stable machine-readable label for the `error.type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoHealthyAccounts { .. } => "no_healthy_accounts",
            Error::TruncatedStream(_) => "truncated_stream",
            Error::Upstream(_) => "upstream_error",
            Error::Pool(err) => match err {
                account_pool::Error::NotFound(_) => "not_found",
                account_pool::Error::DuplicateAccount(_) => "duplicate_account",
                account_pool::Error::InvalidTransition { .. } => "invalid_transition",
                account_pool::Error::LoginInProgress(_) => "login_in_progress",
                account_pool::Error::AccountDisabled(_) => "account_disabled",
                account_pool::Error::PoolExhausted(_) => "no_healthy_accounts",
                account_pool::Error::LoginFailed { .. } => "login_failed",
                account_pool::Error::CorruptSnapshot(_) | account_pool::Error::Io(_) => {
                    "internal_error"
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_maps_to_service_unavailable() {
        let err = Error::NoHealthyAccounts {
            last_failure: "rate limited: slow down".into(),
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.kind(), "no_healthy_accounts");
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn truncation_maps_to_bad_gateway() {
        let err = Error::TruncatedStream("stream read failed".into());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.kind(), "truncated_stream");
    }

    #[test]
    fn fatal_upstream_maps_to_bad_gateway() {
        let err = Error::from(UpstreamError::Fatal("unknown model".into()));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.kind(), "upstream_error");
        assert!(err.to_string().contains("unknown model"));
    }

    #[test]
    fn pool_errors_map_to_store_statuses() {
        let not_found = Error::from(account_pool::Error::NotFound("a@x".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.kind(), "not_found");

        let duplicate = Error::from(account_pool::Error::DuplicateAccount("a@x".into()));
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
        assert_eq!(duplicate.kind(), "duplicate_account");

        let exhausted = Error::from(account_pool::Error::PoolExhausted("0 active".into()));
        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(exhausted.kind(), "no_healthy_accounts");
    }
}
