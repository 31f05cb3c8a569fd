//! Durable pool snapshots
//!
//! The snapshot is a JSON document holding every account in pool order, so
//! the round-robin rotation survives a restart. Saves write to a temporary
//! file in the same directory and rename it over the target; a crash
//! mid-write leaves the previous snapshot intact. Credentials and session
//! tokens are stored with the records, which is why the file is written
//! with 0600 permissions.
//!
//! Loading tolerates what a restart can leave behind: a missing file is an
//! empty pool, `logging_in`/`registering` states collapse to `inactive`,
//! session tokens in states that cannot hold one are dropped, and a row
//! whose registration never completed is dropped entirely.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::record::{AccountRecord, HealthState, Session, epoch_secs};

/// On-disk form of the pool.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    /// Seconds since the epoch at save time. Informational only.
    saved_at: u64,
    accounts: Vec<StoredAccount>,
}

/// On-disk form of one account. Transient runtime state (in-flight request
/// counts) is deliberately absent.
#[derive(Debug, Serialize, Deserialize)]
struct StoredAccount {
    id: String,
    password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_issued_at: Option<u64>,
    state: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<u64>,
    #[serde(default)]
    cooldown_secs: u64,
    #[serde(default)]
    consecutive_failures: u32,
    #[serde(default)]
    login_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_used_at: Option<u64>,
    #[serde(default)]
    total_requests: u64,
    #[serde(default)]
    total_failures: u64,
    #[serde(default)]
    created_at: u64,
}

impl StoredAccount {
    fn from_record(record: &AccountRecord) -> Self {
        StoredAccount {
            id: record.id.clone(),
            password: record.password.expose().clone(),
            session_token: record.session.as_ref().map(|s| s.token.expose().clone()),
            session_issued_at: record.session.as_ref().map(|s| epoch_secs(s.issued_at)),
            state: record.state,
            cooldown_until: record.cooldown_until.map(epoch_secs),
            cooldown_secs: record.cooldown_secs,
            consecutive_failures: record.consecutive_failures,
            login_failures: record.login_failures,
            last_used_at: record.last_used_at.map(epoch_secs),
            total_requests: record.total_requests,
            total_failures: record.total_failures,
            created_at: epoch_secs(record.created_at),
        }
    }

    fn into_record(self) -> AccountRecord {
        // A login or registration that was in flight at save time did not
        // survive the restart.
        let state = match self.state {
            HealthState::LoggingIn | HealthState::Registering => HealthState::Inactive,
            other => other,
        };
        let session = if state.holds_session() {
            self.session_token.map(|token| Session {
                token: Secret::new(token),
                // A missing issue time makes the session stale, which forces
                // a fresh login rather than trusting an unknown token age.
                issued_at: from_epoch(self.session_issued_at.unwrap_or(0)),
            })
        } else {
            None
        };
        let cooldown_until = match state {
            HealthState::RateLimited | HealthState::Degraded => {
                self.cooldown_until.map(from_epoch)
            }
            _ => None,
        };
        AccountRecord {
            id: self.id,
            password: Secret::new(self.password),
            session,
            state,
            cooldown_until,
            cooldown_secs: self.cooldown_secs,
            consecutive_failures: self.consecutive_failures,
            login_failures: self.login_failures,
            last_used_at: self.last_used_at.map(from_epoch),
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            created_at: from_epoch(self.created_at),
        }
    }
}

fn from_epoch(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Load-at-startup / save-on-mutation store for the pool.
pub struct SnapshotStore {
    path: PathBuf,
    /// Serializes concurrent saves; last complete save wins.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot in saved order.
    ///
    /// A missing file is an empty pool. An unreadable or unparseable file is
    /// `CorruptSnapshot`; the caller decides whether to start empty.
    pub async fn load(&self) -> Result<Vec<AccountRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no snapshot file, starting with an empty pool");
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let file: SnapshotFile = serde_json::from_str(&raw)
            .map_err(|e| Error::CorruptSnapshot(format!("parsing snapshot file: {e}")))?;

        let mut records = Vec::with_capacity(file.accounts.len());
        let mut seen = HashSet::new();
        for stored in file.accounts {
            // A row that never got past registration staging has no place in
            // the pool; nothing would ever retry it.
            if stored.state == HealthState::Unregistered {
                warn!(account_id = %stored.id, "registration never completed, dropping from snapshot");
                continue;
            }
            if !seen.insert(stored.id.clone()) {
                warn!(account_id = %stored.id, "duplicate account in snapshot, keeping the first");
                continue;
            }
            records.push(stored.into_record());
        }
        info!(
            accounts = records.len(),
            path = %self.path.display(),
            "snapshot loaded"
        );
        Ok(records)
    }

    /// Replace the snapshot with `records`, atomically.
    pub async fn save(&self, records: &[AccountRecord]) -> Result<()> {
        let file = SnapshotFile {
            saved_at: epoch_secs(SystemTime::now()),
            accounts: records.iter().map(StoredAccount::from_record).collect(),
        };
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, &file).await
    }
}

/// Write a snapshot file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target, so a crash mid-write never damages the previous snapshot.
/// Sets 0600 permissions since the file contains credentials.
async fn write_atomic(path: &Path, file: &SnapshotFile) -> Result<()> {
    let json = serde_json::to_string_pretty(file)
        .map_err(|e| Error::CorruptSnapshot(format!("serializing snapshot: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io(std::io::Error::other("snapshot path has no parent directory")))?;
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let tmp_path = dir.join(format!(".pool-snapshot.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes()).await?;

    // 0600: the snapshot holds passwords and session tokens (unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), "snapshot persisted");
    Ok(())
}

/// Flush the pool to disk when anything changed since the last flush.
/// A failed write re-arms the dirty flag so the next tick retries.
pub async fn flush_if_dirty(pool: &Pool, store: &SnapshotStore) {
    let Some(records) = pool.take_snapshot_if_dirty().await else {
        return;
    };
    let count = records.len();
    if let Err(e) = store.save(&records).await {
        warn!(error = %e, "snapshot save failed, will retry next flush");
        pool.mark_dirty().await;
    } else {
        debug!(accounts = count, "snapshot flushed");
    }
}

/// Unconditional flush, for shutdown.
pub async fn flush(pool: &Pool, store: &SnapshotStore) -> Result<()> {
    let records = pool.snapshot_records().await;
    store.save(&records).await
}

/// Spawn the periodic snapshot flush.
///
/// Persistence stays off the request path: mutations only mark the pool
/// dirty, and this task writes the snapshot every `interval`.
pub fn spawn_flush_task(
    pool: Arc<Pool>,
    store: Arc<SnapshotStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the pool was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            flush_if_dirty(&pool, &store).await;
        }
    })
}
