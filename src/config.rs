//! Runtime configuration.
//!
//! Endpoints and tuning knobs come from the environment (a `.env` file is
//! loaded by the binaries), the relay registry from a TOML file. Missing
//! required endpoints are fatal at startup and surface as [`ConfigError`].

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    Missing(&'static str),
    /// A variable is set but could not be parsed.
    Invalid { key: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "required configuration {} is not set", key),
            Self::Invalid { key, reason } => write!(f, "invalid configuration {}: {}", key, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// External endpoints. Which ones are required depends on the command.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub execution_rpc_url: Option<String>,
    pub execution_ws_url: Option<String>,
    pub beacon_api_url: Option<String>,
}

impl Endpoints {
    pub fn from_env() -> Self {
        Self {
            execution_rpc_url: env_string("EXECUTION_RPC_URL"),
            execution_ws_url: env_string("EXECUTION_WS_URL"),
            beacon_api_url: env_string("BEACON_API_URL"),
        }
    }

    pub fn require_execution_rpc(&self) -> Result<&str, ConfigError> {
        self.execution_rpc_url
            .as_deref()
            .ok_or(ConfigError::Missing("EXECUTION_RPC_URL"))
    }

    pub fn require_execution_ws(&self) -> Result<&str, ConfigError> {
        self.execution_ws_url
            .as_deref()
            .ok_or(ConfigError::Missing("EXECUTION_WS_URL"))
    }
}

// =============================================================================
// RELAY REGISTRY
// =============================================================================

/// Default page size for `proposer_payload_delivered`.
pub const DEFAULT_PAGE_LIMIT: u32 = 200;

/// One relay data API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Stable identity used as the store key and checkpoint source.
    pub id: String,
    /// Base URL, without the data API path.
    pub url: String,
    /// Page size cap for this relay, when lower than the default.
    #[serde(default)]
    pub limit: Option<u32>,
}

impl RelayInfo {
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            url: url.trim_end_matches('/').to_string(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Effective page size, never above the relay's own cap.
    pub fn page_limit(&self, requested: u32) -> u32 {
        match self.limit {
            Some(cap) => requested.min(cap).max(1),
            None => requested.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegistry {
    pub relays: Vec<RelayInfo>,
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self {
            relays: vec![
                RelayInfo::new("flashbots", "https://boost-relay.flashbots.net"),
                RelayInfo::new("bloxroute_max_profit", "https://bloxroute.max-profit.blxrbdn.com"),
                RelayInfo::new("bloxroute_regulated", "https://bloxroute.regulated.blxrbdn.com"),
                RelayInfo::new("ultrasound", "https://relay.ultrasound.money"),
                RelayInfo::new("agnostic", "https://agnostic-relay.net"),
                RelayInfo::new("aestus", "https://mainnet.aestus.live"),
                RelayInfo::new("titan", "https://titanrelay.xyz"),
                RelayInfo::new("eden", "https://relay.edennetwork.io").with_limit(100),
                RelayInfo::new("manifold", "https://mainnet-relay.securerpc.com").with_limit(100),
            ],
        }
    }
}

pub const DEFAULT_RELAYS_PATH: &str = "relays.toml";

impl RelayRegistry {
    /// Load from a TOML file with a `[[relays]]` array.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let registry: Self = toml::from_str(&contents)?;
        Ok(registry)
    }

    /// `RELAYS_CONFIG_PATH`, else `relays.toml`. Only a missing default file
    /// falls back to the built-in list; anything else is a config error.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env_string("RELAYS_CONFIG_PATH") {
            Some(path) => Self::read(&path, false),
            None => Self::read(DEFAULT_RELAYS_PATH, true),
        }
    }

    fn read(path: &str, builtin_if_missing: bool) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            key: "RELAYS_CONFIG_PATH".to_string(),
            reason: format!("{}: {}", path, reason),
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if builtin_if_missing && e.kind() == io::ErrorKind::NotFound => {
                debug!(path, "No relay registry file, using built-in list");
                return Ok(Self::default());
            }
            Err(e) => return Err(invalid(e.to_string())),
        };
        toml::from_str(&contents).map_err(|e| invalid(e.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&RelayInfo> {
        self.relays.iter().find(|r| r.id == id)
    }

    /// Keep only the named relays; an empty filter keeps all.
    pub fn filtered(&self, ids: &[String]) -> Self {
        if ids.is_empty() {
            return self.clone();
        }
        Self {
            relays: self
                .relays
                .iter()
                .filter(|r| ids.iter().any(|id| id == &r.id))
                .cloned()
                .collect(),
        }
    }
}

// =============================================================================
// TUNING
// =============================================================================

/// Retry policy for a single source request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            base_delay: env_millis("FETCH_RETRY_BASE_MS", d.base_delay)?,
            max_delay: env_millis("FETCH_RETRY_MAX_MS", d.max_delay)?,
            max_attempts: env_parse("FETCH_MAX_ATTEMPTS", d.max_attempts)?.max(1),
            request_timeout: env_millis("FETCH_TIMEOUT_MS", d.request_timeout)?,
        })
    }

    /// Delay after attempt `k` (0-based): `base * 2^k`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Cursor walker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerConfig {
    pub page_limit: u32,
    /// Consecutive empty pages before jumping back by `jump_stride`.
    pub empty_streak_threshold: u32,
    pub jump_stride: u64,
    /// Hard cap on fetch attempts per walk.
    pub max_fetch_attempts: u32,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            empty_streak_threshold: 5,
            jump_stride: 20_000,
            max_fetch_attempts: 5_000,
        }
    }
}

impl WalkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            page_limit: env_parse("WALKER_PAGE_LIMIT", d.page_limit)?.max(1),
            empty_streak_threshold: env_parse("WALKER_EMPTY_STREAK", d.empty_streak_threshold)?
                .max(1),
            jump_stride: env_parse("WALKER_JUMP_STRIDE", d.jump_stride)?.max(1),
            max_fetch_attempts: env_parse("WALKER_MAX_ATTEMPTS", d.max_fetch_attempts)?.max(1),
        })
    }
}

/// Live pipeline tuning. The relay delays encode how long relays take to
/// publish delivered payloads and drift over time, so all are configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveConfig {
    pub queue_capacity: usize,
    /// How long the stream waits for queue space before dropping a header.
    pub enqueue_timeout: Duration,
    pub relay_initial_delay: Duration,
    pub relay_retry_interval: Duration,
    /// Total time spent polling relays for one block, initial delay included.
    pub relay_max_elapsed: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// A socket silent for this long is treated as dead and reconnected.
    pub stream_idle_timeout: Duration,
    pub stream_ping_interval: Duration,
    pub status_port: Option<u16>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            enqueue_timeout: Duration::from_secs(2),
            relay_initial_delay: Duration::from_secs(12),
            relay_retry_interval: Duration::from_secs(12),
            relay_max_elapsed: Duration::from_secs(13 * 60),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(60),
            stream_ping_interval: Duration::from_secs(15),
            status_port: None,
        }
    }
}

impl LiveConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let status_port = match env_string("LIVE_STATUS_PORT") {
            None => None,
            Some(raw) => Some(raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                key: "LIVE_STATUS_PORT".to_string(),
                reason: e.to_string(),
            })?),
        };
        Ok(Self {
            queue_capacity: env_parse("LIVE_QUEUE_CAPACITY", d.queue_capacity)?.max(1),
            enqueue_timeout: env_millis("LIVE_ENQUEUE_TIMEOUT_MS", d.enqueue_timeout)?,
            relay_initial_delay: env_millis("LIVE_RELAY_INITIAL_DELAY_MS", d.relay_initial_delay)?,
            relay_retry_interval: env_millis(
                "LIVE_RELAY_RETRY_INTERVAL_MS",
                d.relay_retry_interval,
            )?,
            relay_max_elapsed: env_millis("LIVE_RELAY_MAX_ELAPSED_MS", d.relay_max_elapsed)?,
            reconnect_initial_delay: env_millis(
                "LIVE_RECONNECT_INITIAL_MS",
                d.reconnect_initial_delay,
            )?,
            reconnect_max_delay: env_millis("LIVE_RECONNECT_MAX_MS", d.reconnect_max_delay)?,
            stream_idle_timeout: env_millis(
                "LIVE_STREAM_IDLE_TIMEOUT_MS",
                d.stream_idle_timeout,
            )?,
            stream_ping_interval: env_millis(
                "LIVE_STREAM_PING_INTERVAL_MS",
                d.stream_ping_interval,
            )?
            .max(Duration::from_millis(1)),
            status_port,
        })
    }
}

/// SQLite file path (`MEVWATCH_DB_PATH`, default `mevwatch.db`).
pub fn db_path_from_env() -> String {
    env_string("MEVWATCH_DB_PATH").unwrap_or_else(|| "mevwatch.db".to_string())
}
