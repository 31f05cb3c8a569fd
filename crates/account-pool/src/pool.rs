//! Pool state, the transition engine, and round-robin selection
//!
//! One `RwLock` guards the whole pool: records, the insertion-order list the
//! round-robin scan walks, the cursor, and the dirty flag the snapshot flush
//! watches. Selection and cursor advance therefore happen in a single atomic
//! step, and transitions are serialized with everything that reads state.
//! Nothing in here performs network I/O while the lock is held; callers get
//! ids and cloned credentials as handles and come back with the outcome.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use common::Secret;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use upstream::ErrorKind;

use crate::error::{Error, Result};
use crate::record::{AccountRecord, AccountView, HealthState, Session, permitted};

/// Tunable pool behavior. The defaults are the documented configuration
/// defaults; the gateway overrides them from its config file.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// First cooldown after an upstream rate limit.
    pub rate_limit_backoff: Duration,
    /// First cooldown after a transient failure.
    pub degraded_backoff: Duration,
    /// Ceiling for doubled cooldowns.
    pub backoff_cap: Duration,
    /// Consecutive failed logins before an account is disabled.
    pub max_login_failures: u32,
    /// Failure streak a `Degraded` account must exceed to be disabled.
    pub disable_threshold: u32,
    /// Age at which a cached session stops being reused.
    pub session_ttl: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            rate_limit_backoff: Duration::from_secs(60),
            degraded_backoff: Duration::from_secs(15),
            backoff_cap: Duration::from_secs(3600),
            max_login_failures: 3,
            disable_threshold: 5,
            session_ttl: Duration::from_secs(43_200),
        }
    }
}

/// What `begin_login` decided under the lock.
#[derive(Debug)]
pub enum LoginDecision {
    /// A fresh session already exists; use this token as-is.
    Cached(Secret<String>),
    /// The caller owns the login attempt now (the account is `LoggingIn`)
    /// and must settle it with `complete_login`.
    Login { password: Secret<String> },
}

/// One probe the monitor should run now.
#[derive(Debug)]
pub struct ProbeTarget {
    pub id: String,
    pub state: HealthState,
    /// Existing session token to validate, when one survives.
    pub token: Option<Secret<String>>,
    /// Credentials for a login probe when no session exists.
    pub password: Secret<String>,
}

/// Aggregate counts for the stats endpoint and exhaustion diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub cooling_down: usize,
    pub inactive: usize,
    /// Unregistered, registering, or logging in.
    pub pending: usize,
    pub disabled: usize,
    pub in_flight: u64,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// RAII marker for one request in flight against one account. Dropping it,
/// on completion and on cancellation alike, releases the slot.
pub struct InFlightGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything the pool lock guards. `order` is insertion order and is what
/// the cursor indexes; `records` is keyed by account id.
struct PoolInner {
    order: Vec<String>,
    records: HashMap<String, AccountRecord>,
    cursor: usize,
    dirty: bool,
}

/// The account pool. Owns every record exclusively; other components refer
/// to accounts by id and go through the methods here.
pub struct Pool {
    inner: RwLock<PoolInner>,
    settings: PoolSettings,
    in_flight: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl Pool {
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_accounts(settings, Vec::new())
    }

    /// Build a pool from loaded records, preserving their order so the
    /// round-robin rotation is stable across restarts.
    pub fn with_accounts(settings: PoolSettings, records: Vec<AccountRecord>) -> Self {
        let order: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let records: HashMap<String, AccountRecord> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();
        info!(accounts = order.len(), "pool initialized");
        Pool {
            inner: RwLock::new(PoolInner {
                order,
                records,
                cursor: 0,
                dirty: false,
            }),
            settings,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Add an account. Fails with `DuplicateAccount` when the id is taken.
    pub async fn add(&self, record: AccountRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.id) {
            return Err(Error::DuplicateAccount(record.id));
        }
        info!(account_id = %record.id, state = record.state.label(), "account added to pool");
        inner.order.push(record.id.clone());
        inner.records.insert(record.id.clone(), record);
        inner.dirty = true;
        Ok(())
    }

    /// Remove an account outright. Requests already holding the id finish on
    /// their own; no new selection can land on it.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.records.remove(id).is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        if let Some(pos) = inner.order.iter().position(|o| o == id) {
            inner.order.remove(pos);
            if pos < inner.cursor {
                inner.cursor -= 1;
            }
        }
        if inner.order.is_empty() {
            inner.cursor = 0;
        } else {
            inner.cursor %= inner.order.len();
        }
        inner.dirty = true;
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.remove(id);
        drop(in_flight);
        info!(account_id = id, "account removed from pool");
        Ok(())
    }

    /// Redacted view of one account.
    pub async fn view(&self, id: &str) -> Result<AccountView> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .map(|r| r.view(SystemTime::now()))
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Redacted views in insertion order, optionally filtered by state.
    pub async fn list(&self, filter: Option<HealthState>) -> Vec<AccountView> {
        let inner = self.inner.read().await;
        let now = SystemTime::now();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| filter.is_none_or(|f| r.state == f))
            .map(|r| r.view(now))
            .collect()
    }

    /// Full record clone for in-crate callers and tests.
    pub(crate) async fn get(&self, id: &str) -> Result<AccountRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Move an account along one edge of the state machine.
    ///
    /// This is the only path by which state changes. Entry side effects are
    /// applied here: `Active` clears cooldown and the failure streak,
    /// `RateLimited`/`Degraded` stamp a cooldown (doubling on a self-edge,
    /// capped), and states that cannot hold a session drop it.
    pub async fn transition(&self, id: &str, to: HealthState, reason: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.apply_transition(&mut inner, id, to, reason)
    }

    fn apply_transition(
        &self,
        inner: &mut PoolInner,
        id: &str,
        to: HealthState,
        reason: &str,
    ) -> Result<()> {
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let from = record.state;
        if !permitted(from, to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }
        record.state = to;
        match to {
            HealthState::Active => {
                record.cooldown_until = None;
                record.cooldown_secs = 0;
                record.consecutive_failures = 0;
            }
            HealthState::RateLimited => {
                Self::stamp_cooldown(
                    record,
                    from == HealthState::RateLimited,
                    self.settings.rate_limit_backoff.as_secs(),
                    self.settings.backoff_cap.as_secs(),
                );
            }
            HealthState::Degraded => {
                Self::stamp_cooldown(
                    record,
                    from == HealthState::Degraded,
                    self.settings.degraded_backoff.as_secs(),
                    self.settings.backoff_cap.as_secs(),
                );
            }
            _ => {
                record.cooldown_until = None;
                record.cooldown_secs = 0;
            }
        }
        if !to.holds_session() {
            record.session = None;
        }
        inner.dirty = true;
        info!(
            account_id = id,
            from = from.label(),
            to = to.label(),
            reason,
            "account state transition"
        );
        Ok(())
    }

    /// Base backoff on first entry, double the previous window (capped) on a
    /// self-edge.
    fn stamp_cooldown(record: &mut AccountRecord, repeat: bool, base_secs: u64, cap_secs: u64) {
        let secs = if repeat && record.cooldown_secs > 0 {
            record.cooldown_secs.saturating_mul(2).min(cap_secs)
        } else {
            base_secs.min(cap_secs)
        };
        record.cooldown_secs = secs;
        record.cooldown_until = Some(SystemTime::now() + Duration::from_secs(secs));
    }

    /// Round-robin selection over `Active` accounts.
    ///
    /// Scans insertion order starting at the cursor, skipping excluded ids
    /// and anything not `Active`, and advances the cursor past the returned
    /// account. Selection and cursor advance happen under one lock
    /// acquisition, so two concurrent callers never receive the same id
    /// unless it is the only eligible account.
    ///
    /// Returns `PoolExhausted` with a pool summary when nothing is eligible.
    pub async fn select(&self, exclude: &HashSet<String>) -> Result<String> {
        let mut inner = self.inner.write().await;
        let n = inner.order.len();
        if n == 0 {
            return Err(Error::PoolExhausted(String::from("pool is empty")));
        }
        let start = inner.cursor % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let id = &inner.order[idx];
            if exclude.contains(id) {
                continue;
            }
            let eligible = inner
                .records
                .get(id)
                .is_some_and(|r| r.state == HealthState::Active);
            if eligible {
                let id = id.clone();
                inner.cursor = (idx + 1) % n;
                debug!(account_id = %id, "account selected");
                return Ok(id);
            }
        }
        Err(Error::PoolExhausted(Self::exhausted_summary(
            &inner,
            exclude.len(),
        )))
    }

    fn exhausted_summary(inner: &PoolInner, excluded: usize) -> String {
        let mut active = 0usize;
        let mut cooling = 0usize;
        let mut disabled = 0usize;
        let mut pending = 0usize;
        let mut inactive = 0usize;
        for record in inner.records.values() {
            match record.state {
                HealthState::Active => active += 1,
                HealthState::RateLimited | HealthState::Degraded => cooling += 1,
                HealthState::Inactive => inactive += 1,
                HealthState::Disabled => disabled += 1,
                _ => pending += 1,
            }
        }
        format!(
            "{} accounts ({} excluded this request): {} active, {} cooling down, \
             {} inactive, {} pending, {} disabled",
            inner.order.len(),
            excluded,
            active,
            cooling,
            inactive,
            pending,
            disabled
        )
    }

    /// Record a completed request: reset the failure streak and bump usage
    /// counters. State is left alone.
    pub async fn record_success(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.consecutive_failures = 0;
        record.last_used_at = Some(SystemTime::now());
        record.total_requests += 1;
        inner.dirty = true;
        Ok(())
    }

    /// Record a failed request and drive the matching health edge.
    ///
    /// `Fatal` failures indict the request, not the account, and change
    /// nothing. If the account already left `Active` (a concurrent request
    /// or probe got there first) the counters still move but the state is
    /// not touched again.
    pub async fn record_failure(&self, id: &str, kind: ErrorKind) -> Result<()> {
        let (target, reason) = match kind {
            ErrorKind::Fatal => return Ok(()),
            ErrorKind::RateLimited => (HealthState::RateLimited, "upstream rate limit"),
            ErrorKind::Auth => (HealthState::Inactive, "session rejected"),
            ErrorKind::Transient => (HealthState::Degraded, "transient upstream failure"),
        };
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.consecutive_failures += 1;
        record.total_failures += 1;
        let from = record.state;
        inner.dirty = true;
        if from != HealthState::Active {
            debug!(
                account_id = id,
                state = from.label(),
                "failure reported for non-active account, state untouched"
            );
            return Ok(());
        }
        self.apply_transition(&mut inner, id, target, reason)
    }

    /// Start using a session for `id`, logging in if needed.
    ///
    /// Returns `Cached` with the existing token when a fresh session exists.
    /// Otherwise moves the account to `LoggingIn` and returns `Login` with
    /// the credentials; the caller performs the login outside the lock and
    /// settles it with [`Pool::complete_login`]. A second caller arriving
    /// while the attempt is in flight gets `LoginInProgress`.
    pub async fn begin_login(&self, id: &str) -> Result<LoginDecision> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let now = SystemTime::now();
        let ttl = self.settings.session_ttl;

        match record.state {
            HealthState::Disabled => return Err(Error::AccountDisabled(id.to_string())),
            HealthState::LoggingIn => return Err(Error::LoginInProgress(id.to_string())),
            state if state.holds_session() => {
                if let Some(session) = &record.session {
                    if !session.expired(ttl, now) {
                        return Ok(LoginDecision::Cached(session.token.clone()));
                    }
                }
                // Session missing or stale. Only an Active account can walk
                // back to Inactive and log in again here; cooling accounts
                // are the monitor's job.
                if state != HealthState::Active {
                    return Err(Error::InvalidTransition {
                        id: id.to_string(),
                        from: state,
                        to: HealthState::LoggingIn,
                    });
                }
                self.apply_transition(&mut inner, id, HealthState::Inactive, "session expired")?;
            }
            _ => {}
        }

        self.apply_transition(&mut inner, id, HealthState::LoggingIn, "login started")?;
        let record = inner
            .records
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(LoginDecision::Login {
            password: record.password.clone(),
        })
    }

    /// Settle a login attempt begun with [`Pool::begin_login`].
    ///
    /// Success installs the session and activates the account. A failure
    /// counts toward `max_login_failures`; the account returns to `Inactive`
    /// until the streak crosses the limit, then it is disabled.
    pub async fn complete_login(
        &self,
        id: &str,
        outcome: std::result::Result<Secret<String>, ErrorKind>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        match outcome {
            Ok(token) => {
                self.apply_transition(&mut inner, id, HealthState::Active, "login succeeded")?;
                let record = inner
                    .records
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                record.session = Some(Session::new(token));
                record.login_failures = 0;
                inner.dirty = true;
                Ok(())
            }
            Err(kind) => {
                let record = inner
                    .records
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                record.login_failures += 1;
                record.consecutive_failures += 1;
                record.total_failures += 1;
                let failures = record.login_failures;
                inner.dirty = true;
                warn!(
                    account_id = id,
                    kind = kind.label(),
                    failures,
                    "login attempt failed"
                );
                let (target, reason) = if failures >= self.settings.max_login_failures {
                    (HealthState::Disabled, "login failure limit reached")
                } else {
                    (HealthState::Inactive, "login failed")
                };
                self.apply_transition(&mut inner, id, target, reason)
            }
        }
    }

    /// A probe brought the account back: activate it. `refreshed` carries a
    /// new token when the probe had to log in from scratch; `None` keeps the
    /// session the probe validated.
    pub async fn probe_succeeded(&self, id: &str, refreshed: Option<Secret<String>>) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.apply_transition(&mut inner, id, HealthState::Active, "probe succeeded")?;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(token) = refreshed {
            record.session = Some(Session::new(token));
        }
        record.login_failures = 0;
        inner.dirty = true;
        Ok(())
    }

    /// A probe failed. The cooling state is re-entered (doubling the
    /// backoff); a `Degraded` account whose streak exceeds the threshold is
    /// disabled instead. An `Auth` failure also drops the session so the
    /// next probe logs in from scratch.
    pub async fn probe_failed(&self, id: &str, kind: ErrorKind) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.consecutive_failures += 1;
        record.total_failures += 1;
        if kind == ErrorKind::Auth {
            record.session = None;
        }
        let from = record.state;
        let failures = record.consecutive_failures;
        inner.dirty = true;
        let (target, reason) = match from {
            HealthState::Degraded if failures > self.settings.disable_threshold => {
                (HealthState::Disabled, "failure threshold exceeded")
            }
            HealthState::Degraded => (HealthState::Degraded, "probe failed"),
            HealthState::RateLimited => (HealthState::RateLimited, "probe failed"),
            _ => {
                debug!(
                    account_id = id,
                    state = from.label(),
                    "probe failure for account no longer cooling down"
                );
                return Ok(());
            }
        };
        self.apply_transition(&mut inner, id, target, reason)
    }

    /// Accounts whose probe is due: anything `Inactive`, plus `RateLimited`
    /// and `Degraded` accounts whose cooldown has elapsed.
    pub async fn due_probes(&self) -> Vec<ProbeTarget> {
        let inner = self.inner.read().await;
        let now = SystemTime::now();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| match r.state {
                HealthState::Inactive => true,
                HealthState::RateLimited | HealthState::Degraded => !r.in_cooldown(now),
                _ => false,
            })
            .map(|r| ProbeTarget {
                id: r.id.clone(),
                state: r.state,
                token: r.session.as_ref().map(|s| s.token.clone()),
                password: r.password.clone(),
            })
            .collect()
    }

    /// Operator reset: puts a `Disabled` account back into rotation via
    /// `Inactive` with a clean failure history.
    pub async fn reset(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.apply_transition(&mut inner, id, HealthState::Inactive, "manual reset")?;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.consecutive_failures = 0;
        record.login_failures = 0;
        inner.dirty = true;
        Ok(())
    }

    /// Aggregate counts across the pool.
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.read().await;
        let mut stats = PoolStats {
            total: inner.order.len(),
            in_flight: self.in_flight_total(),
            ..PoolStats::default()
        };
        for record in inner.records.values() {
            match record.state {
                HealthState::Active => stats.active += 1,
                HealthState::RateLimited | HealthState::Degraded => stats.cooling_down += 1,
                HealthState::Inactive => stats.inactive += 1,
                HealthState::Disabled => stats.disabled += 1,
                _ => stats.pending += 1,
            }
            stats.total_requests += record.total_requests;
            stats.total_failures += record.total_failures;
        }
        stats
    }

    /// Clone every record in insertion order, for persistence.
    pub async fn snapshot_records(&self) -> Vec<AccountRecord> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    /// Snapshot and clear the dirty flag in one step, or `None` when nothing
    /// changed since the last snapshot.
    pub async fn take_snapshot_if_dirty(&self) -> Option<Vec<AccountRecord>> {
        let mut inner = self.inner.write().await;
        if !inner.dirty {
            return None;
        }
        inner.dirty = false;
        let records = inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect();
        Some(records)
    }

    /// Re-arm the dirty flag, used when a snapshot write failed and should
    /// be retried on the next flush tick.
    pub async fn mark_dirty(&self) {
        self.inner.write().await.dirty = true;
    }

    /// Mark a request in flight against `id`.
    pub fn begin_request(&self, id: &str) -> InFlightGuard {
        let counter = {
            let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(id.to_string()).or_default())
        };
        counter.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counter }
    }

    /// Requests currently in flight across all accounts.
    pub fn in_flight_total(&self) -> u64 {
        let map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> Secret<String> {
        Secret::new(String::from(s))
    }

    async fn add_active(pool: &Pool, id: &str) {
        pool.add(AccountRecord::new(id, secret("pw"))).await.unwrap();
        pool.begin_login(id).await.unwrap();
        pool.complete_login(id, Ok(secret(&format!("tok-{id}"))))
            .await
            .unwrap();
    }

    async fn pool_with_active(ids: &[&str]) -> Pool {
        let pool = Pool::new(PoolSettings::default());
        for id in ids {
            add_active(&pool, id).await;
        }
        pool
    }

    #[tokio::test]
    async fn round_robin_cycles_through_accounts() {
        let pool = pool_with_active(&["a", "b"]).await;
        let none = HashSet::new();

        let s1 = pool.select(&none).await.unwrap();
        let s2 = pool.select(&none).await.unwrap();
        let s3 = pool.select(&none).await.unwrap();

        assert_eq!(s1, "a");
        assert_eq!(s2, "b");
        assert_eq!(s3, "a");
    }

    #[tokio::test]
    async fn each_account_appears_once_per_full_cycle() {
        let pool = pool_with_active(&["a", "b", "c"]).await;
        let none = HashSet::new();

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(pool.select(&none).await.unwrap());
        }
        assert_eq!(seen, ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn select_skips_excluded_and_non_active_accounts() {
        let pool = pool_with_active(&["a", "b", "c"]).await;
        pool.record_failure("a", ErrorKind::RateLimited).await.unwrap();

        let mut exclude = HashSet::new();
        exclude.insert(String::from("b"));

        let s1 = pool.select(&exclude).await.unwrap();
        let s2 = pool.select(&exclude).await.unwrap();
        assert_eq!(s1, "c");
        assert_eq!(s2, "c");
    }

    #[tokio::test]
    async fn select_with_everything_excluded_is_pool_exhausted() {
        let pool = pool_with_active(&["a", "b"]).await;
        let all: HashSet<String> = [String::from("a"), String::from("b")].into();

        let err = pool.select(&all).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn select_on_empty_pool_is_pool_exhausted() {
        let pool = Pool::new(PoolSettings::default());
        let err = pool.select(&HashSet::new()).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn exhausted_error_summarizes_pool_state() {
        let pool = pool_with_active(&["a", "b"]).await;
        pool.record_failure("a", ErrorKind::RateLimited).await.unwrap();
        pool.record_failure("b", ErrorKind::Transient).await.unwrap();

        let err = pool.select(&HashSet::new()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("0 active"), "{msg}");
        assert!(msg.contains("2 cooling down"), "{msg}");
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let pool = Pool::new(PoolSettings::default());
        pool.add(AccountRecord::new("a", secret("pw"))).await.unwrap();

        let err = pool
            .add(AccountRecord::new("a", secret("other")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAccount(_)));
    }

    #[tokio::test]
    async fn remove_keeps_rotation_fair() {
        let pool = pool_with_active(&["a", "b", "c"]).await;
        let none = HashSet::new();

        assert_eq!(pool.select(&none).await.unwrap(), "a");
        pool.remove("a").await.unwrap();

        assert_eq!(pool.select(&none).await.unwrap(), "b");
        assert_eq!(pool.select(&none).await.unwrap(), "c");
        assert_eq!(pool.select(&none).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn remove_missing_account_is_not_found() {
        let pool = Pool::new(PoolSettings::default());
        let err = pool.remove("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_transition_is_typed_and_leaves_state_alone() {
        let pool = Pool::new(PoolSettings::default());
        pool.add(AccountRecord::new("a", secret("pw"))).await.unwrap();

        let err = pool
            .transition("a", HealthState::RateLimited, "test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: HealthState::Inactive,
                to: HealthState::RateLimited,
                ..
            }
        ));
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Inactive);
    }

    #[tokio::test]
    async fn rate_limit_starts_cooldown_and_probe_failures_double_it() {
        let settings = PoolSettings {
            rate_limit_backoff: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(200),
            ..PoolSettings::default()
        };
        let pool = Pool::new(settings);
        add_active(&pool, "a").await;

        pool.record_failure("a", ErrorKind::RateLimited).await.unwrap();
        let rec = pool.get("a").await.unwrap();
        assert_eq!(rec.state, HealthState::RateLimited);
        assert_eq!(rec.cooldown_secs, 60);
        assert!(rec.in_cooldown(SystemTime::now()));
        // Session survives rate limiting
        assert!(rec.session.is_some());

        pool.probe_failed("a", ErrorKind::RateLimited).await.unwrap();
        assert_eq!(pool.get("a").await.unwrap().cooldown_secs, 120);

        pool.probe_failed("a", ErrorKind::Transient).await.unwrap();
        assert_eq!(pool.get("a").await.unwrap().cooldown_secs, 200);
    }

    #[tokio::test]
    async fn probe_success_reactivates_and_clears_cooldown() {
        let pool = pool_with_active(&["a"]).await;
        pool.record_failure("a", ErrorKind::RateLimited).await.unwrap();

        pool.probe_succeeded("a", None).await.unwrap();
        let rec = pool.get("a").await.unwrap();
        assert_eq!(rec.state, HealthState::Active);
        assert!(rec.cooldown_until.is_none());
        assert_eq!(rec.cooldown_secs, 0);
        assert_eq!(rec.consecutive_failures, 0);
        assert!(rec.session.is_some());
    }

    #[tokio::test]
    async fn auth_failure_forces_relogin() {
        let pool = pool_with_active(&["a"]).await;

        pool.record_failure("a", ErrorKind::Auth).await.unwrap();
        let rec = pool.get("a").await.unwrap();
        assert_eq!(rec.state, HealthState::Inactive);
        assert!(rec.session.is_none());
    }

    #[tokio::test]
    async fn fatal_failures_never_touch_the_account() {
        let pool = pool_with_active(&["a"]).await;
        let _ = pool.take_snapshot_if_dirty().await;

        pool.record_failure("a", ErrorKind::Fatal).await.unwrap();
        let rec = pool.get("a").await.unwrap();
        assert_eq!(rec.state, HealthState::Active);
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.total_failures, 0);
        assert!(rec.cooldown_until.is_none());
        assert!(rec.session.is_some());
        assert!(
            pool.take_snapshot_if_dirty().await.is_none(),
            "a fatal report must not dirty the pool"
        );

        // The report resolves before the account lookup
        pool.record_failure("missing", ErrorKind::Fatal).await.unwrap();
    }

    #[tokio::test]
    async fn login_failure_streak_disables_the_account() {
        let settings = PoolSettings {
            max_login_failures: 2,
            ..PoolSettings::default()
        };
        let pool = Pool::new(settings);
        pool.add(AccountRecord::new("a", secret("pw"))).await.unwrap();

        pool.begin_login("a").await.unwrap();
        pool.complete_login("a", Err(ErrorKind::Auth)).await.unwrap();
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Inactive);

        pool.begin_login("a").await.unwrap();
        pool.complete_login("a", Err(ErrorKind::Auth)).await.unwrap();
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Disabled);

        let err = pool.begin_login("a").await.unwrap_err();
        assert!(matches!(err, Error::AccountDisabled(_)));
    }

    #[tokio::test]
    async fn successful_login_clears_the_failure_streak() {
        let settings = PoolSettings {
            max_login_failures: 2,
            ..PoolSettings::default()
        };
        let pool = Pool::new(settings);
        pool.add(AccountRecord::new("a", secret("pw"))).await.unwrap();

        pool.begin_login("a").await.unwrap();
        pool.complete_login("a", Err(ErrorKind::Transient)).await.unwrap();

        pool.begin_login("a").await.unwrap();
        pool.complete_login("a", Ok(secret("tok"))).await.unwrap();
        assert_eq!(pool.get("a").await.unwrap().login_failures, 0);

        // The streak starts over after a success
        pool.record_failure("a", ErrorKind::Auth).await.unwrap();
        pool.begin_login("a").await.unwrap();
        pool.complete_login("a", Err(ErrorKind::Transient)).await.unwrap();
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Inactive);
    }

    #[tokio::test]
    async fn concurrent_login_attempts_are_rejected() {
        let pool = Pool::new(PoolSettings::default());
        pool.add(AccountRecord::new("a", secret("pw"))).await.unwrap();

        let decision = pool.begin_login("a").await.unwrap();
        assert!(matches!(decision, LoginDecision::Login { .. }));

        let err = pool.begin_login("a").await.unwrap_err();
        assert!(matches!(err, Error::LoginInProgress(_)));
    }

    #[tokio::test]
    async fn fresh_session_is_reused_without_login() {
        let pool = pool_with_active(&["a"]).await;

        match pool.begin_login("a").await.unwrap() {
            LoginDecision::Cached(token) => assert_eq!(token.expose(), "tok-a"),
            LoginDecision::Login { .. } => panic!("expected cached session"),
        }
    }

    #[tokio::test]
    async fn stale_session_triggers_a_new_login() {
        let settings = PoolSettings {
            session_ttl: Duration::ZERO,
            ..PoolSettings::default()
        };
        let pool = Pool::new(settings);
        add_active(&pool, "a").await;

        let decision = pool.begin_login("a").await.unwrap();
        assert!(matches!(decision, LoginDecision::Login { .. }));
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::LoggingIn);
    }

    #[tokio::test]
    async fn degraded_streak_past_threshold_disables() {
        let settings = PoolSettings {
            disable_threshold: 2,
            degraded_backoff: Duration::ZERO,
            ..PoolSettings::default()
        };
        let pool = Pool::new(settings);
        add_active(&pool, "a").await;

        pool.record_failure("a", ErrorKind::Transient).await.unwrap();
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Degraded);

        pool.probe_failed("a", ErrorKind::Transient).await.unwrap();
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Degraded);

        pool.probe_failed("a", ErrorKind::Transient).await.unwrap();
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Disabled);
    }

    #[tokio::test]
    async fn reset_revives_a_disabled_account() {
        let settings = PoolSettings {
            max_login_failures: 1,
            ..PoolSettings::default()
        };
        let pool = Pool::new(settings);
        pool.add(AccountRecord::new("a", secret("pw"))).await.unwrap();
        pool.begin_login("a").await.unwrap();
        pool.complete_login("a", Err(ErrorKind::Auth)).await.unwrap();
        assert_eq!(pool.view("a").await.unwrap().state, HealthState::Disabled);

        pool.reset("a").await.unwrap();
        let rec = pool.get("a").await.unwrap();
        assert_eq!(rec.state, HealthState::Inactive);
        assert_eq!(rec.login_failures, 0);
        assert_eq!(rec.consecutive_failures, 0);

        let err = pool.reset("a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn due_probes_covers_inactive_and_cooled_accounts() {
        let settings = PoolSettings {
            rate_limit_backoff: Duration::ZERO,
            ..PoolSettings::default()
        };
        let pool = Pool::new(settings);
        pool.add(AccountRecord::new("idle", secret("pw"))).await.unwrap();
        add_active(&pool, "limited").await;
        add_active(&pool, "busy").await;
        pool.record_failure("limited", ErrorKind::RateLimited)
            .await
            .unwrap();

        let due = pool.due_probes().await;
        let ids: Vec<&str> = due.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["idle", "limited"]);

        let limited = due.iter().find(|p| p.id == "limited").unwrap();
        assert_eq!(limited.state, HealthState::RateLimited);
        assert!(limited.token.is_some());

        let idle = due.iter().find(|p| p.id == "idle").unwrap();
        assert!(idle.token.is_none());
    }

    #[tokio::test]
    async fn cooldown_still_open_keeps_account_out_of_probes() {
        let pool = pool_with_active(&["a"]).await;
        pool.record_failure("a", ErrorKind::RateLimited).await.unwrap();

        assert!(pool.due_probes().await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_taken_only_when_dirty() {
        let pool = Pool::with_accounts(
            PoolSettings::default(),
            vec![AccountRecord::new("a", secret("pw"))],
        );
        assert!(pool.take_snapshot_if_dirty().await.is_none());

        pool.add(AccountRecord::new("b", secret("pw"))).await.unwrap();
        let records = pool.take_snapshot_if_dirty().await.unwrap();
        assert_eq!(records.len(), 2);

        assert!(pool.take_snapshot_if_dirty().await.is_none());
    }

    #[tokio::test]
    async fn in_flight_guards_count_up_and_down() {
        let pool = pool_with_active(&["a"]).await;
        assert_eq!(pool.in_flight_total(), 0);

        let g1 = pool.begin_request("a");
        let g2 = pool.begin_request("a");
        assert_eq!(pool.in_flight_total(), 2);

        drop(g1);
        assert_eq!(pool.in_flight_total(), 1);
        drop(g2);
        assert_eq!(pool.in_flight_total(), 0);
    }

    #[tokio::test]
    async fn stats_reflects_per_state_counts() {
        let pool = pool_with_active(&["a", "b"]).await;
        pool.add(AccountRecord::new("c", secret("pw"))).await.unwrap();
        pool.record_failure("a", ErrorKind::RateLimited).await.unwrap();
        pool.record_success("b").await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.cooling_down, 1);
        assert_eq!(stats.inactive, 1);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_failures, 1);
    }
}
