//! Account pool with health tracking, sessions, and failover state
//!
//! Manages a set of upstream accounts behind one scheduler: round-robin
//! selection over `Active` accounts, a closed health state machine with
//! cooldown backoff, login/registration through `SessionManager`, periodic
//! recovery probes, and a JSON snapshot that survives restarts.
//!
//! Account lifecycle:
//! 1. Admin adds an account (or a registration batch creates one) → `Inactive`
//! 2. Login installs a session → `Active`, eligible for selection
//! 3. Upstream 429 → `RateLimited` with a cooldown; transient errors → `Degraded`
//! 4. Session rejections → `Inactive`, forcing a re-login on next use
//! 5. The monitor probes cooled-down accounts back to `Active`, doubling the
//!    backoff (capped) each time a probe fails
//! 6. Repeated failures disable the account until an operator resets it

pub mod error;
pub mod monitor;
pub mod pool;
pub mod record;
pub mod session;
pub mod snapshot;

pub use error::{Error, Result};
pub use monitor::{ProbeSummary, run_probe_cycle, spawn_monitor_task};
pub use pool::{InFlightGuard, LoginDecision, Pool, PoolSettings, PoolStats, ProbeTarget};
pub use record::{AccountRecord, AccountView, HealthState, Session};
pub use session::{RegistrationFailure, RegistrationReport, SessionManager};
pub use snapshot::{SnapshotStore, flush, flush_if_dirty, spawn_flush_task};
