//! Server configuration.
//!
//! Defaults match a small team deployment. `from_env` overlays the
//! `COLLAB_*` environment variables on top of the defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Connections silent for longer than this are evicted
    pub idle_timeout: Duration,
    /// Interval of the idle sweep (and of server pings)
    pub sweep_interval: Duration,
    /// Shared secret clients must present; `None` = open access
    pub auth_token: Option<String>,
    /// Task store file watched for external changes
    pub tasks_file: PathBuf,
    /// Quiet window used to coalesce bursts of file events
    pub watch_debounce: Duration,
    /// Lock TTL used when a request omits `timeoutMs`
    pub default_lock_ttl: Duration,
    /// Upper bound on any requested lock TTL
    pub max_lock_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            max_connections: 100,
            idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            auth_token: None,
            tasks_file: PathBuf::from("data/tasks.json"),
            watch_debounce: Duration::from_millis(100),
            default_lock_ttl: Duration::from_millis(30_000),
            max_lock_ttl: Duration::from_millis(300_000),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "COLLAB_MAX_CONNECTIONS")? {
            config.max_connections = non_zero("COLLAB_MAX_CONNECTIONS", max)?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "COLLAB_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(non_zero("COLLAB_IDLE_TIMEOUT_SECS", secs)?);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "COLLAB_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval =
                Duration::from_secs(non_zero("COLLAB_SWEEP_INTERVAL_SECS", secs)?);
        }
        // Empty secret means open mode.
        config.auth_token = lookup("COLLAB_AUTH_TOKEN").filter(|t| !t.is_empty());
        if let Some(path) = lookup("COLLAB_TASKS_FILE") {
            config.tasks_file = PathBuf::from(path);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COLLAB_WATCH_DEBOUNCE_MS")? {
            config.watch_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COLLAB_DEFAULT_LOCK_TTL_MS")? {
            config.default_lock_ttl =
                Duration::from_millis(non_zero("COLLAB_DEFAULT_LOCK_TTL_MS", ms)?);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COLLAB_MAX_LOCK_TTL_MS")? {
            config.max_lock_ttl = Duration::from_millis(non_zero("COLLAB_MAX_LOCK_TTL_MS", ms)?);
        }

        if config.default_lock_ttl > config.max_lock_ttl {
            return Err(ConfigError::InvalidValue {
                var: "COLLAB_DEFAULT_LOCK_TTL_MS",
                value: config.default_lock_ttl.as_millis().to_string(),
                reason: "exceeds COLLAB_MAX_LOCK_TTL_MS".to_string(),
            });
        }

        Ok(config)
    }

    /// Clamp a client-requested TTL in milliseconds to the configured bounds.
    ///
    /// A missing or zero TTL falls back to `default_lock_ttl`.
    pub fn lock_ttl(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_lock_ttl),
            _ => self.default_lock_ttl,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn non_zero<T: PartialEq + Default + ToString>(var: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
