//! Account records and the health state machine
//!
//! An [`AccountRecord`] is everything the pool knows about one upstream
//! identity: credentials, the live session (if any), health state, cooldown
//! bookkeeping, and usage counters. State only ever changes through
//! `Pool::transition`, which validates edges against [`permitted`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};

/// Health state of an account.
///
/// Only `Active` accounts are eligible for request selection. Everything
/// else is either on its way there (registration/login), waiting out a
/// cooldown, or out of rotation entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Staged in the pool but not yet created upstream.
    Unregistered,
    /// A registration worker is creating the upstream account.
    Registering,
    /// Has credentials, no live session; next use triggers login.
    Inactive,
    /// A login attempt is in flight.
    LoggingIn,
    /// Live session, eligible for selection.
    Active,
    /// Hit the upstream rate limit; ineligible until `cooldown_until`.
    RateLimited,
    /// Transient upstream trouble; ineligible until `cooldown_until`.
    Degraded,
    /// Out of rotation; only an explicit reset revives it.
    Disabled,
}

impl HealthState {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            HealthState::Unregistered => "unregistered",
            HealthState::Registering => "registering",
            HealthState::Inactive => "inactive",
            HealthState::LoggingIn => "logging_in",
            HealthState::Active => "active",
            HealthState::RateLimited => "rate_limited",
            HealthState::Degraded => "degraded",
            HealthState::Disabled => "disabled",
        }
    }

    /// Whether a session token may exist in this state. A session survives
    /// rate limiting and degradation (the token is still valid, the account
    /// just sits out), but never deactivation or disablement.
    pub fn holds_session(&self) -> bool {
        matches!(
            self,
            HealthState::Active | HealthState::RateLimited | HealthState::Degraded
        )
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The transition table. Any edge not listed here is rejected.
///
/// Self-edges on `RateLimited` and `Degraded` are probe failures after the
/// cooldown elapsed; they double the backoff rather than changing state.
pub fn permitted(from: HealthState, to: HealthState) -> bool {
    use HealthState::*;
    matches!(
        (from, to),
        (Unregistered, Registering)
            | (Registering, Inactive)
            | (Inactive, LoggingIn)
            | (LoggingIn, Active)
            | (LoggingIn, Inactive)
            | (LoggingIn, Disabled)
            | (Active, RateLimited)
            | (Active, Degraded)
            | (Active, Inactive)
            | (RateLimited, Active)
            | (RateLimited, RateLimited)
            | (Degraded, Active)
            | (Degraded, Degraded)
            | (Degraded, Disabled)
            | (Disabled, Inactive)
    )
}

/// A live upstream session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: Secret<String>,
    pub issued_at: SystemTime,
}

impl Session {
    pub fn new(token: Secret<String>) -> Self {
        Session {
            token,
            issued_at: SystemTime::now(),
        }
    }

    /// Whether the session has outlived `ttl` at `now`.
    pub fn expired(&self, ttl: Duration, now: SystemTime) -> bool {
        match now.duration_since(self.issued_at) {
            Ok(age) => age >= ttl,
            Err(_) => false,
        }
    }
}

/// One upstream identity. The id doubles as the login email.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub id: String,
    pub password: Secret<String>,
    pub session: Option<Session>,
    pub state: HealthState,
    /// Ineligible for probing until this instant. Meaningful only in
    /// `RateLimited` / `Degraded`; cleared on every other entry.
    pub cooldown_until: Option<SystemTime>,
    /// Backoff the current cooldown was stamped with, in seconds. Doubled
    /// (capped) on each probe failure.
    pub cooldown_secs: u64,
    /// Failures since the last success; reset by any success.
    pub consecutive_failures: u32,
    /// Consecutive failed login attempts; reset by a successful login.
    pub login_failures: u32,
    pub last_used_at: Option<SystemTime>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub created_at: SystemTime,
}

impl AccountRecord {
    /// Record for an account that already exists upstream.
    pub fn new(id: impl Into<String>, password: Secret<String>) -> Self {
        Self::with_state(id.into(), password, HealthState::Inactive)
    }

    /// Record staged for registration; nothing exists upstream yet.
    pub fn staged(id: impl Into<String>, password: Secret<String>) -> Self {
        Self::with_state(id.into(), password, HealthState::Unregistered)
    }

    fn with_state(id: String, password: Secret<String>, state: HealthState) -> Self {
        AccountRecord {
            id,
            password,
            session: None,
            state,
            cooldown_until: None,
            cooldown_secs: 0,
            consecutive_failures: 0,
            login_failures: 0,
            last_used_at: None,
            total_requests: 0,
            total_failures: 0,
            created_at: SystemTime::now(),
        }
    }

    /// Whether the cooldown window is still open at `now`.
    pub fn in_cooldown(&self, now: SystemTime) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }

    /// Time left in the cooldown window, if one is open.
    pub fn cooldown_remaining(&self, now: SystemTime) -> Option<Duration> {
        self.cooldown_until
            .and_then(|until| until.duration_since(now).ok())
    }

    /// Redacted projection for listings; never carries credentials or
    /// session tokens.
    pub fn view(&self, now: SystemTime) -> AccountView {
        AccountView {
            id: self.id.clone(),
            state: self.state,
            has_session: self.session.is_some(),
            consecutive_failures: self.consecutive_failures,
            cooldown_remaining_secs: self.cooldown_remaining(now).map(|d| d.as_secs()),
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            last_used_at: self.last_used_at.map(epoch_secs),
            created_at: epoch_secs(self.created_at),
        }
    }
}

/// What account listings and status endpoints expose.
#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    pub id: String,
    pub state: HealthState,
    pub has_session: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
    pub total_requests: u64,
    pub total_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
    pub created_at: u64,
}

/// Seconds since the Unix epoch.
pub(crate) fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
