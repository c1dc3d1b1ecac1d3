//! Sync engine tunables

mod cache;

pub use cache::{SettingsCache, SYNC_ALL_LAB_REQUESTS};

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for the central sync manager and materializer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Devices that have not checked in for longer drop out of the queue
    pub queue_freshness: Duration,
    /// Open sessions allowed at once before admission answers `ActiveSync`
    pub max_concurrent_sessions: u32,
    /// Idle time after which an open session is errored
    pub session_timeout: Duration,
    /// Serve pulls from the lookup table instead of the entity tables
    pub lookup_table_enabled: bool,
    pub lookup_interval: Duration,
    pub lookup_max_retries: u32,
    pub lookup_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_freshness: Duration::from_secs(300),
            max_concurrent_sessions: 4,
            session_timeout: Duration::from_secs(600),
            lookup_table_enabled: true,
            lookup_interval: Duration::from_secs(30),
            lookup_max_retries: 5,
            lookup_backoff: Duration::from_millis(500),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let queue_freshness_secs = parse_u64(
            &lookup,
            "TICKSYNC_QUEUE_FRESHNESS_SECS",
            defaults.queue_freshness.as_secs(),
        )?;
        if queue_freshness_secs == 0 {
            return Err(ConfigError::Invalid(
                "TICKSYNC_QUEUE_FRESHNESS_SECS must be > 0".to_string(),
            ));
        }

        let max_concurrent_sessions = parse_u64(
            &lookup,
            "TICKSYNC_MAX_CONCURRENT_SESSIONS",
            u64::from(defaults.max_concurrent_sessions),
        )?;
        let max_concurrent_sessions = u32::try_from(max_concurrent_sessions)
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "TICKSYNC_MAX_CONCURRENT_SESSIONS must be between 1 and 4294967295"
                        .to_string(),
                )
            })?;

        let session_timeout_secs = parse_u64(
            &lookup,
            "TICKSYNC_SESSION_TIMEOUT_SECS",
            defaults.session_timeout.as_secs(),
        )?;

        let lookup_table_enabled = match optional_trimmed(&lookup, "TICKSYNC_LOOKUP_ENABLED") {
            None => defaults.lookup_table_enabled,
            Some(value) => parse_bool(&value).ok_or_else(|| {
                ConfigError::Invalid("TICKSYNC_LOOKUP_ENABLED must be true or false".to_string())
            })?,
        };

        let lookup_interval_secs = parse_u64(
            &lookup,
            "TICKSYNC_LOOKUP_INTERVAL_SECS",
            defaults.lookup_interval.as_secs(),
        )?;
        if lookup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "TICKSYNC_LOOKUP_INTERVAL_SECS must be > 0".to_string(),
            ));
        }

        let lookup_max_retries = parse_u64(
            &lookup,
            "TICKSYNC_LOOKUP_MAX_RETRIES",
            u64::from(defaults.lookup_max_retries),
        )?;
        let lookup_max_retries = u32::try_from(lookup_max_retries).map_err(|_| {
            ConfigError::Invalid("TICKSYNC_LOOKUP_MAX_RETRIES is too large".to_string())
        })?;

        let lookup_backoff_ms = parse_u64(
            &lookup,
            "TICKSYNC_LOOKUP_BACKOFF_MS",
            u64::try_from(defaults.lookup_backoff.as_millis()).unwrap_or(u64::MAX),
        )?;

        Ok(Self {
            queue_freshness: Duration::from_secs(queue_freshness_secs),
            max_concurrent_sessions,
            session_timeout: Duration::from_secs(session_timeout_secs),
            lookup_table_enabled,
            lookup_interval: Duration::from_secs(lookup_interval_secs),
            lookup_max_retries,
            lookup_backoff: Duration::from_millis(lookup_backoff_ms),
        })
    }
}

fn parse_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    optional_trimmed(lookup, name).map_or(Ok(default), |value| {
        value
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(format!("{name} must be a non-negative integer")))
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
