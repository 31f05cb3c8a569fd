//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults. A missing
//! config file is not an error; the gateway runs on documented defaults so a
//! bare `pool-gateway` invocation works against a local upstream.

use account_pool::PoolSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    pub register: RegisterConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "127.0.0.1:8100".parse().expect("valid default addr"),
            max_connections: 512,
            drain_timeout_secs: 5,
        }
    }
}

/// Upstream chat service settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    /// Idle read timeout between response chunks. There is deliberately no
    /// total request timeout: a healthy chat stream can outlive any fixed
    /// deadline.
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            base_url: "http://127.0.0.1:8787".into(),
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
        }
    }
}

/// Account pool tuning
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub snapshot_path: PathBuf,
    /// Distinct accounts tried per request before giving up.
    pub retry_budget: usize,
    pub flush_interval_secs: u64,
    pub session_ttl_secs: u64,
    pub max_login_failures: u32,
    pub disable_threshold: u32,
    pub rate_limit_backoff_secs: u64,
    pub degraded_backoff_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            snapshot_path: PathBuf::from("accounts.json"),
            retry_budget: 3,
            flush_interval_secs: 5,
            session_ttl_secs: 43_200,
            max_login_failures: 3,
            disable_threshold: 5,
            rate_limit_backoff_secs: 60,
            degraded_backoff_secs: 15,
            backoff_cap_secs: 3600,
        }
    }
}

/// Background health monitor settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub probe_interval_secs: u64,
    pub probe_concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            probe_interval_secs: 300,
            probe_concurrency: 4,
        }
    }
}

/// Batch registration settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub email_domain: String,
    pub default_concurrency: usize,
    /// Model used when a chat request does not name one.
    pub default_model: String,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        RegisterConfig {
            email_domain: "gmail.com".into(),
            default_concurrency: 3,
            default_model: "claude-sonnet-4-5".into(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables. A missing file yields the defaults.
    ///
    /// Env overrides:
    /// - `POOL_GATEWAY_LISTEN` replaces `server.listen_addr`
    /// - `POOL_GATEWAY_UPSTREAM` replaces `upstream.base_url`
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };

        if let Ok(addr) = std::env::var("POOL_GATEWAY_LISTEN") {
            config.server.listen_addr = addr.parse().map_err(|e| {
                common::Error::Config(format!("invalid POOL_GATEWAY_LISTEN {addr:?}: {e}"))
            })?;
        }
        if let Ok(url) = std::env::var("POOL_GATEWAY_UPSTREAM") {
            config.upstream.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream.base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if self.pool.retry_budget == 0 {
            return Err(common::Error::Config(
                "pool.retry_budget must be greater than 0".into(),
            ));
        }
        if self.pool.flush_interval_secs == 0 {
            return Err(common::Error::Config(
                "pool.flush_interval_secs must be greater than 0".into(),
            ));
        }
        if self.monitor.probe_interval_secs == 0 {
            return Err(common::Error::Config(
                "monitor.probe_interval_secs must be greater than 0".into(),
            ));
        }
        if self.monitor.probe_concurrency == 0 {
            return Err(common::Error::Config(
                "monitor.probe_concurrency must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }
        if self.upstream.connect_timeout_secs == 0 || self.upstream.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream timeouts must be greater than 0".into(),
            ));
        }
        if self.register.email_domain.is_empty() {
            return Err(common::Error::Config(
                "register.email_domain must not be empty".into(),
            ));
        }
        if self.register.default_concurrency == 0 {
            return Err(common::Error::Config(
                "register.default_concurrency must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or POOL_GATEWAY_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("POOL_GATEWAY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("pool-gateway.toml")
    }

    /// Pool tuning knobs in the form the account pool consumes.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            rate_limit_backoff: Duration::from_secs(self.pool.rate_limit_backoff_secs),
            degraded_backoff: Duration::from_secs(self.pool.degraded_backoff_secs),
            backoff_cap: Duration::from_secs(self.pool.backoff_cap_secs),
            max_login_failures: self.pool.max_login_failures,
            disable_threshold: self.pool.disable_threshold,
            session_ttl: Duration::from_secs(self.pool.session_ttl_secs),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.pool.flush_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.probe_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.server.drain_timeout_secs)
    }
}
