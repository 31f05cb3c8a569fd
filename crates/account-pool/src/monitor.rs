//! Background health probing
//!
//! A recurring cycle probes every account that is due: `Inactive` accounts
//! get a login attempt, cooled-down `RateLimited`/`Degraded` accounts get a
//! session check, or a fresh login when their session is gone. Probes run
//! under a concurrency cap so mass recovery never turns into a storm
//! against the upstream.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pool::ProbeTarget;
use crate::record::HealthState;
use crate::session::SessionManager;

/// What one probe cycle did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProbeSummary {
    pub probed: usize,
    pub recovered: usize,
    pub failed: usize,
}

/// Spawn the recurring probe loop.
///
/// Runs a cycle every `interval` with at most `concurrency` probes in
/// flight. Returns the `JoinHandle` for the spawned task.
pub fn spawn_monitor_task(
    manager: SessionManager,
    interval: Duration,
    concurrency: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // A long cycle should not be followed by a burst of catch-up ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick; startup logins just ran
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let summary = run_probe_cycle(&manager, concurrency).await;
            if summary.probed > 0 {
                info!(
                    probed = summary.probed,
                    recovered = summary.recovered,
                    failed = summary.failed,
                    "probe cycle finished"
                );
            }
        }
    })
}

/// Run one probe cycle over every due account.
///
/// Also called directly by the manual health check trigger.
pub async fn run_probe_cycle(manager: &SessionManager, concurrency: usize) -> ProbeSummary {
    let targets = manager.pool().due_probes().await;
    if targets.is_empty() {
        return ProbeSummary::default();
    }

    let probed = targets.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for target in targets {
        let semaphore = Arc::clone(&semaphore);
        let manager = manager.clone();
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return false,
            };
            probe_one(&manager, target).await
        });
    }

    let mut summary = ProbeSummary {
        probed,
        ..ProbeSummary::default()
    };
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => summary.recovered += 1,
            _ => summary.failed += 1,
        }
    }
    summary
}

/// Probe one account. Returns whether it is `Active` afterwards.
async fn probe_one(manager: &SessionManager, target: ProbeTarget) -> bool {
    match target.state {
        HealthState::Inactive => match manager.ensure_session(&target.id).await {
            Ok(_) => {
                debug!(account_id = %target.id, "inactive account brought up");
                true
            }
            Err(e) => {
                debug!(account_id = %target.id, error = %e, "inactive account still down");
                false
            }
        },
        HealthState::RateLimited | HealthState::Degraded => probe_cooling(manager, &target).await,
        _ => false,
    }
}

/// Probe a cooled-down account: validate the surviving session, or log in
/// from scratch when none survived.
async fn probe_cooling(manager: &SessionManager, target: &ProbeTarget) -> bool {
    let pool = manager.pool();
    let result = match &target.token {
        Some(token) => manager.api().check_session(token).await.map(|()| None),
        None => manager
            .api()
            .login(&target.id, &target.password)
            .await
            .map(Some),
    };

    match result {
        Ok(refreshed) => match pool.probe_succeeded(&target.id, refreshed).await {
            Ok(()) => {
                info!(
                    account_id = %target.id,
                    from = target.state.label(),
                    "account recovered"
                );
                true
            }
            Err(e) => {
                debug!(account_id = %target.id, error = %e, "probe result discarded, account moved on");
                false
            }
        },
        Err(e) => {
            let kind = e.kind();
            warn!(account_id = %target.id, kind = kind.label(), error = %e, "probe failed");
            if let Err(pool_err) = pool.probe_failed(&target.id, kind).await {
                debug!(account_id = %target.id, error = %pool_err, "probe failure discarded, account moved on");
            }
            false
        }
    }
}
