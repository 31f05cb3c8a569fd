//! Session lifecycle and batch account registration
//!
//! `SessionManager` is the only component that talks to the upstream auth
//! endpoints. It turns stored credentials into live session tokens through
//! the pool's `begin_login`/`complete_login` pair, so the account is marked
//! `LoggingIn` while the network call runs and no lock is held across it.
//! Registration creates brand new upstream accounts through a bounded
//! worker pool with per-item failure reporting.

use std::sync::Arc;

use common::Secret;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use upstream::{ChatApi, creds};

use crate::error::{Error, Result};
use crate::pool::{LoginDecision, Pool};
use crate::record::{AccountRecord, HealthState};

/// Outcome of one registration batch. Failures never abort the batch; every
/// item lands in exactly one of the two lists.
#[derive(Debug, Serialize)]
pub struct RegistrationReport {
    pub requested: usize,
    pub created: Vec<String>,
    pub failed: Vec<RegistrationFailure>,
}

/// One failed registration attempt.
#[derive(Debug, Serialize)]
pub struct RegistrationFailure {
    pub id: String,
    pub error: String,
}

/// Turns credentials into sessions and creates new upstream accounts.
#[derive(Clone)]
pub struct SessionManager {
    pool: Arc<Pool>,
    api: Arc<dyn ChatApi>,
    email_domain: String,
}

impl SessionManager {
    pub fn new(pool: Arc<Pool>, api: Arc<dyn ChatApi>, email_domain: impl Into<String>) -> Self {
        SessionManager {
            pool,
            api,
            email_domain: email_domain.into(),
        }
    }

    /// Pool handle, shared with the monitor and the gateway surface.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Upstream handle, shared with the monitor's probes.
    pub fn api(&self) -> &Arc<dyn ChatApi> {
        &self.api
    }

    /// Return a live session token for `id`, logging in if the cached one
    /// is missing or stale.
    pub async fn ensure_session(&self, id: &str) -> Result<Secret<String>> {
        match self.pool.begin_login(id).await? {
            LoginDecision::Cached(token) => Ok(token),
            LoginDecision::Login { password } => self.login(id, password).await,
        }
    }

    async fn login(&self, id: &str, password: Secret<String>) -> Result<Secret<String>> {
        debug!(account_id = id, "logging in");
        match self.api.login(id, &password).await {
            Ok(token) => {
                self.pool.complete_login(id, Ok(token.clone())).await?;
                info!(account_id = id, "login succeeded");
                Ok(token)
            }
            Err(e) => {
                self.pool.complete_login(id, Err(e.kind())).await?;
                Err(Error::LoginFailed {
                    id: id.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Log every `Inactive` account in, at most `concurrency` at a time.
    /// Returns how many came up `Active`. Used at startup and by the manual
    /// health check trigger.
    pub async fn login_all(&self, concurrency: usize) -> usize {
        let targets: Vec<String> = self
            .pool
            .list(Some(HealthState::Inactive))
            .await
            .into_iter()
            .map(|view| view.id)
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for id in targets {
            let semaphore = Arc::clone(&semaphore);
            let manager = self.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return false,
                };
                match manager.ensure_session(&id).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(account_id = %id, error = %e, "startup login failed");
                        false
                    }
                }
            });
        }

        let mut logged_in = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                logged_in += 1;
            }
        }
        logged_in
    }

    /// Create `count` new upstream accounts, at most `concurrency`
    /// registrations in flight at once.
    ///
    /// Each success inserts an `Inactive` account with generated
    /// credentials. Each failure is reported per item and leaves no record
    /// behind; the rest of the batch keeps going.
    pub async fn register(&self, count: usize, concurrency: usize) -> RegistrationReport {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for _ in 0..count {
            let semaphore = Arc::clone(&semaphore);
            let manager = self.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(RegistrationFailure {
                            id: String::new(),
                            error: String::from("registration worker stopped"),
                        });
                    }
                };
                manager.register_one().await
            });
        }

        let mut report = RegistrationReport {
            requested: count,
            created: Vec::new(),
            failed: Vec::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(id)) => report.created.push(id),
                Ok(Err(failure)) => report.failed.push(failure),
                Err(e) => report.failed.push(RegistrationFailure {
                    id: String::new(),
                    error: format!("registration task failed: {e}"),
                }),
            }
        }
        info!(
            requested = count,
            created = report.created.len(),
            failed = report.failed.len(),
            "registration batch finished"
        );
        report
    }

    async fn register_one(&self) -> std::result::Result<String, RegistrationFailure> {
        let id = creds::generate_email(&self.email_domain);
        let password = creds::generate_password();

        // Stage the record first so the id is reserved while the upstream
        // call runs; a failure removes it again.
        let staged = AccountRecord::staged(id.clone(), password.clone());
        if let Err(e) = self.pool.add(staged).await {
            return Err(RegistrationFailure {
                id,
                error: e.to_string(),
            });
        }
        if let Err(e) = self
            .pool
            .transition(&id, HealthState::Registering, "registration started")
            .await
        {
            self.discard_staged(&id).await;
            return Err(RegistrationFailure {
                id,
                error: e.to_string(),
            });
        }

        match self.api.register(&id, &password).await {
            Ok(()) => {
                if let Err(e) = self
                    .pool
                    .transition(&id, HealthState::Inactive, "registration succeeded")
                    .await
                {
                    return Err(RegistrationFailure {
                        id,
                        error: e.to_string(),
                    });
                }
                info!(account_id = %id, "account registered");
                Ok(id)
            }
            Err(e) => {
                warn!(account_id = %id, error = %e, "registration failed");
                self.discard_staged(&id).await;
                Err(RegistrationFailure {
                    id,
                    error: e.to_string(),
                })
            }
        }
    }

    async fn discard_staged(&self, id: &str) {
        if let Err(e) = self.pool.remove(id).await {
            debug!(account_id = id, error = %e, "staged registration record already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use upstream::{ChatRequest, ChatStream, UpstreamError};

    /// Scripted upstream double. The first `login_failures` logins and the
    /// first `register_failures` registrations fail; everything after
    /// succeeds. Tracks the peak number of concurrent register calls.
    #[derive(Default)]
    struct TestApi {
        login_failures: usize,
        register_failures: usize,
        login_calls: AtomicUsize,
        register_calls: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ChatApi for TestApi {
        fn login<'a>(
            &'a self,
            _email: &'a str,
            _password: &'a Secret<String>,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<Secret<String>>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.login_calls.fetch_add(1, Ordering::SeqCst);
                if n < self.login_failures {
                    Err(UpstreamError::Auth(String::from("bad credentials")))
                } else {
                    Ok(Secret::new(format!("tok-{n}")))
                }
            })
        }

        fn register<'a>(
            &'a self,
            _email: &'a str,
            _password: &'a Secret<String>,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<()>> + Send + 'a>> {
            Box::pin(async move {
                let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                let n = self.register_calls.fetch_add(1, Ordering::SeqCst);
                self.current.fetch_sub(1, Ordering::SeqCst);
                if n < self.register_failures {
                    Err(UpstreamError::Transient(String::from("signup rejected")))
                } else {
                    Ok(())
                }
            })
        }

        fn check_session<'a>(
            &'a self,
            _token: &'a Secret<String>,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }

        fn chat<'a>(
            &'a self,
            _token: &'a Secret<String>,
            _request: &'a ChatRequest,
        ) -> Pin<Box<dyn Future<Output = upstream::Result<ChatStream>> + Send + 'a>> {
            Box::pin(async { Err(UpstreamError::Fatal(String::from("not wired in this test"))) })
        }
    }

    fn manager_with(api: TestApi, settings: PoolSettings) -> (Arc<Pool>, SessionManager) {
        let pool = Arc::new(Pool::new(settings));
        let manager = SessionManager::new(Arc::clone(&pool), Arc::new(api), "test.local");
        (pool, manager)
    }

    async fn add_inactive(pool: &Pool, id: &str) {
        pool.add(AccountRecord::new(id, Secret::new(String::from("pw"))))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ensure_session_logs_in_then_reuses_the_cached_token() {
        let (pool, manager) = manager_with(TestApi::default(), PoolSettings::default());
        add_inactive(&pool, "a@test.local").await;

        let first = manager.ensure_session("a@test.local").await.unwrap();
        assert_eq!(first.expose(), "tok-0");
        assert_eq!(
            pool.view("a@test.local").await.unwrap().state,
            HealthState::Active
        );

        let second = manager.ensure_session("a@test.local").await.unwrap();
        assert_eq!(second.expose(), "tok-0");
    }

    #[tokio::test]
    async fn failed_logins_surface_and_eventually_disable() {
        let api = TestApi {
            login_failures: usize::MAX,
            ..TestApi::default()
        };
        let settings = PoolSettings {
            max_login_failures: 2,
            ..PoolSettings::default()
        };
        let (pool, manager) = manager_with(api, settings);
        add_inactive(&pool, "a@test.local").await;

        let err = manager.ensure_session("a@test.local").await.unwrap_err();
        assert!(matches!(err, Error::LoginFailed { .. }));
        assert_eq!(
            pool.view("a@test.local").await.unwrap().state,
            HealthState::Inactive
        );

        let err = manager.ensure_session("a@test.local").await.unwrap_err();
        assert!(matches!(err, Error::LoginFailed { .. }));
        assert_eq!(
            pool.view("a@test.local").await.unwrap().state,
            HealthState::Disabled
        );

        let err = manager.ensure_session("a@test.local").await.unwrap_err();
        assert!(matches!(err, Error::AccountDisabled(_)));
    }

    #[tokio::test]
    async fn login_error_detail_never_contains_the_password() {
        let api = TestApi {
            login_failures: usize::MAX,
            ..TestApi::default()
        };
        let (pool, manager) = manager_with(api, PoolSettings::default());
        add_inactive(&pool, "a@test.local").await;

        let err = manager.ensure_session("a@test.local").await.unwrap_err();
        assert!(!err.to_string().contains("pw"));
    }

    #[tokio::test]
    async fn register_batch_reports_partial_failures() {
        let api = TestApi {
            register_failures: 3,
            ..TestApi::default()
        };
        let (pool, manager) = manager_with(api, PoolSettings::default());

        let report = manager.register(10, 3).await;

        assert_eq!(report.requested, 10);
        assert_eq!(report.created.len(), 7);
        assert_eq!(report.failed.len(), 3);
        for id in &report.created {
            assert!(id.ends_with("@test.local"), "{id}");
        }

        let stats = pool.stats().await;
        assert_eq!(stats.total, 7);
        assert_eq!(stats.inactive, 7);
    }

    #[tokio::test]
    async fn register_batch_respects_the_concurrency_cap() {
        let api = Arc::new(TestApi::default());
        let pool = Arc::new(Pool::new(PoolSettings::default()));
        let manager = SessionManager::new(
            Arc::clone(&pool),
            Arc::clone(&api) as Arc<dyn ChatApi>,
            "test.local",
        );

        let report = manager.register(10, 3).await;

        assert_eq!(report.created.len(), 10);
        let peak = api.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak was {peak}");
    }

    #[tokio::test]
    async fn failed_registration_leaves_no_record_behind() {
        let api = TestApi {
            register_failures: usize::MAX,
            ..TestApi::default()
        };
        let (pool, manager) = manager_with(api, PoolSettings::default());

        let report = manager.register(2, 1).await;

        assert!(report.created.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test]
    async fn login_all_activates_every_inactive_account() {
        let (pool, manager) = manager_with(TestApi::default(), PoolSettings::default());
        for id in ["a@test.local", "b@test.local", "c@test.local"] {
            add_inactive(&pool, id).await;
        }

        let logged_in = manager.login_all(2).await;

        assert_eq!(logged_in, 3);
        let stats = pool.stats().await;
        assert_eq!(stats.active, 3);
    }
}
