//! Pool error types

use crate::record::HealthState;

/// Errors from pool, snapshot, and session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An account with this id already exists in the pool.
    #[error("account already exists: {0}")]
    DuplicateAccount(String),

    /// No account with this id.
    #[error("account not found: {0}")]
    NotFound(String),

    /// The requested state change is not an edge of the health state machine.
    /// The record is left unchanged.
    #[error("invalid transition for account {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: HealthState,
        to: HealthState,
    },

    /// Another task is already logging this account in.
    #[error("login already in progress for account {0}")]
    LoginInProgress(String),

    /// Every account was excluded, cooling down, or otherwise unselectable.
    /// The message summarizes pool state at the time of the scan.
    #[error("no account available: {0}")]
    PoolExhausted(String),

    /// The account is administratively disabled and will not be used.
    #[error("account is disabled: {0}")]
    AccountDisabled(String),

    /// Login against the upstream failed for this account.
    #[error("login failed for account {id}: {detail}")]
    LoginFailed { id: String, detail: String },

    /// The snapshot file exists but could not be parsed. The caller decides
    /// whether to start empty or abort.
    #[error("snapshot is corrupt: {0}")]
    CorruptSnapshot(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_both_states() {
        let err = Error::InvalidTransition {
            id: "acct-1".into(),
            from: HealthState::Inactive,
            to: HealthState::RateLimited,
        };
        let msg = err.to_string();
        assert!(msg.contains("acct-1"));
        assert!(msg.contains("inactive"));
        assert!(msg.contains("rate_limited"));
    }

    #[test]
    fn corrupt_snapshot_preserves_detail() {
        let err = Error::CorruptSnapshot("expected value at line 1".into());
        assert!(err.to_string().contains("expected value"));
    }
}
