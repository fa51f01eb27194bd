//! Configuration management for the client.

use crate::auth::KdfParams;
use crate::sync::RetryPolicy;
use hearth_engine::ConflictStrategy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How long a cached entry stays fresh.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// How long an offline session lasts.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Bound on every per-record remote call during a sync pass.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Durable store location (SQLite URL)
    pub database_url: String,
    /// Remote base URL; the in-memory remote is used when absent
    pub remote_url: Option<String>,
    /// Bearer token sent to the remote
    pub remote_token: Option<String>,
    /// User the remote identity service has signed in
    pub user_id: Option<String>,
    pub cache_ttl: Duration,
    pub session_ttl: Duration,
    pub remote_timeout: Duration,
    /// Periodic sync interval; no periodic sync when absent
    pub sync_interval: Option<Duration>,
    /// Administrative sync switch
    pub sync_enabled: bool,
    pub conflict_strategy: ConflictStrategy,
    pub retry_policy: RetryPolicy,
    /// Cost of the offline PIN hash
    pub kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://hearth.db".to_string(),
            remote_url: None,
            remote_token: None,
            user_id: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            session_ttl: DEFAULT_SESSION_TTL,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            sync_interval: None,
            sync_enabled: true,
            conflict_strategy: ConflictStrategy::default(),
            retry_policy: RetryPolicy::default(),
            kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("HEARTH_DATABASE_URL").unwrap_or(defaults.database_url);
        let remote_url = get("HEARTH_REMOTE_URL");
        let remote_token = get("HEARTH_REMOTE_TOKEN");
        let user_id = get("HEARTH_USER_ID");

        let cache_ttl = parse::<u64>(&get, "HEARTH_CACHE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);
        let session_ttl = parse::<u64>(&get, "HEARTH_SESSION_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_ttl);
        let remote_timeout = parse::<u64>(&get, "HEARTH_REMOTE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.remote_timeout);
        let sync_interval = parse::<u64>(&get, "HEARTH_SYNC_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let sync_enabled = parse::<bool>(&get, "HEARTH_SYNC_ENABLED")?.unwrap_or(true);

        let conflict_strategy = match get("HEARTH_CONFLICT_STRATEGY") {
            Some(raw) => raw
                .parse::<ConflictStrategy>()
                .map_err(|_| ConfigError::Invalid {
                    var: "HEARTH_CONFLICT_STRATEGY",
                    value: raw,
                })?,
            None => defaults.conflict_strategy,
        };

        let retry_policy = match parse::<u32>(&get, "HEARTH_SYNC_RETRY_ATTEMPTS")? {
            Some(attempts) if attempts > 0 => RetryPolicy::InPass { attempts },
            _ => RetryPolicy::DeferToNextTrigger,
        };

        if cache_ttl.is_zero() {
            return Err(ConfigError::Invalid {
                var: "HEARTH_CACHE_TTL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url,
            remote_url,
            remote_token,
            user_id,
            cache_ttl,
            session_ttl,
            remote_timeout,
            sync_interval,
            sync_enabled,
            conflict_strategy,
            retry_policy,
            kdf: defaults.kdf,
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },
}
