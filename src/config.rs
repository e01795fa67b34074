//! Runtime configuration.
//!
//! The server reads its settings from environment variables (a `.env` file is
//! honored via `dotenvy`); the client is configured in code.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::client::Backoff;
use crate::crdt::SiteId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("invalid listen address {0}")]
    InvalidAddress(String),
}

/// Server configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bind host (default: 127.0.0.1)
    pub host: String,
    /// Bind port (default: 3000)
    pub port: u16,
    /// SQLite database file; the operation log is kept in memory when unset
    pub database_path: Option<PathBuf>,
    /// Operations between snapshots (default: 100)
    pub snapshot_interval: u64,
    /// How often each document runs tombstone collection (default: 30s)
    pub gc_interval: Duration,
    /// How long a disconnected session holds back collection (default: 1h)
    pub session_retention: Duration,
    /// How long an operation may wait for its dependencies (default: 10s)
    pub causal_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_path: None,
            snapshot_interval: 100,
            gc_interval: Duration::from_secs(30),
            session_retention: Duration::from_secs(3600),
            causal_timeout: Duration::from_millis(10_000),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from any key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerConfig::default();
        let number = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber { key, value }),
            }
        };

        let port = number("PORT", u64::from(defaults.port))?;
        let port = u16::try_from(port).map_err(|_| ConfigError::InvalidNumber {
            key: "PORT",
            value: port.to_string(),
        })?;

        Ok(ServerConfig {
            host: lookup("HOST").unwrap_or(defaults.host),
            port,
            database_path: lookup("DATABASE_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            snapshot_interval: number("SNAPSHOT_INTERVAL", defaults.snapshot_interval)?.max(1),
            gc_interval: Duration::from_secs(number(
                "GC_INTERVAL_SECS",
                defaults.gc_interval.as_secs(),
            )?),
            session_retention: Duration::from_secs(number(
                "SESSION_RETENTION_SECS",
                defaults.session_retention.as_secs(),
            )?),
            causal_timeout: Duration::from_millis(number(
                "CAUSAL_TIMEOUT_MS",
                defaults.causal_timeout.as_millis() as u64,
            )?),
        })
    }

    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidAddress(addr))
    }
}

/// Settings for a [`SyncClient`](crate::client::SyncClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:3000/ws`
    pub server_url: String,
    pub document_id: String,
    pub site_id: SiteId,
    pub backoff: Backoff,
    /// File backing the offline queue; in memory only when `None`. An
    /// existing queue file overrides `site_id` with the site that wrote it.
    pub offline_queue_path: Option<PathBuf>,
    pub causal_timeout: Duration,
}

impl ClientConfig {
    /// A configuration with a fresh random site id.
    pub fn new(server_url: impl Into<String>, document_id: impl Into<String>) -> Self {
        ClientConfig {
            server_url: server_url.into(),
            document_id: document_id.into(),
            site_id: Uuid::new_v4().to_string(),
            backoff: Backoff::default(),
            offline_queue_path: None,
            causal_timeout: Duration::from_millis(10_000),
        }
    }

    pub fn with_site_id(mut self, site_id: impl Into<SiteId>) -> Self {
        self.site_id = site_id.into();
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_offline_queue(mut self, path: impl Into<PathBuf>) -> Self {
        self.offline_queue_path = Some(path.into());
        self
    }

    pub fn with_causal_timeout(mut self, timeout: Duration) -> Self {
        self.causal_timeout = timeout;
        self
    }
}
