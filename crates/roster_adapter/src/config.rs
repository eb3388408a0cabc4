#![forbid(unsafe_code)]

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use roster_kernel_contracts::presence::FreshnessWindow;

pub const ENV_HTTP_BIND: &str = "ROSTER_HTTP_BIND";
pub const ENV_FRESHNESS_WINDOW_SECS: &str = "ROSTER_FRESHNESS_WINDOW_SECS";
pub const ENV_LOCK_TIMEOUT_MS: &str = "ROSTER_LOCK_TIMEOUT_MS";
pub const ENV_SNAPSHOT_PATH: &str = "ROSTER_SNAPSHOT_PATH";
pub const ENV_FLUSH_INTERVAL_MS: &str = "ROSTER_FLUSH_INTERVAL_MS";
pub const ENV_NAME_MAP_PATH: &str = "ROSTER_NAME_MAP_PATH";

const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, thiserror::Error)]
pub enum AdapterConfigError {
    #[error("ROSTER_HTTP_BIND={value} is not a socket address: {source}")]
    Bind {
        value: String,
        source: std::net::AddrParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    pub window: FreshnessWindow,
    pub lock_timeout: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub flush_interval: Duration,
    pub name_map_path: Option<PathBuf>,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, AdapterConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Only the bind address is fatal; other out-of-range values fall back to defaults.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AdapterConfigError> {
        let bind_raw = lookup(ENV_HTTP_BIND).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .trim()
            .parse()
            .map_err(|source| AdapterConfigError::Bind {
                value: bind_raw.clone(),
                source,
            })?;

        let window = parse_u64(&lookup, ENV_FRESHNESS_WINDOW_SECS)
            .and_then(|secs| FreshnessWindow::from_secs(secs).ok())
            .unwrap_or_default();
        let lock_timeout_ms = parse_u64(&lookup, ENV_LOCK_TIMEOUT_MS)
            .filter(|v| (10..=60_000).contains(v))
            .unwrap_or(2_000);
        let flush_interval_ms = parse_u64(&lookup, ENV_FLUSH_INTERVAL_MS)
            .filter(|v| (100..=600_000).contains(v))
            .unwrap_or(5_000);

        Ok(Self {
            bind,
            window,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            snapshot_path: parse_path(&lookup, ENV_SNAPSHOT_PATH),
            flush_interval: Duration::from_millis(flush_interval_ms),
            name_map_path: parse_path(&lookup, ENV_NAME_MAP_PATH),
        })
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_path(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<PathBuf> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
