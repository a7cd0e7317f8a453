//! Environment-backed runtime configuration for the sync client.

use std::{env, time::Duration};

use thiserror::Error;

use crate::{
    cache::{DEFAULT_CHANNEL_LIMIT, DEFAULT_WINDOW_CAPACITY},
    retry::BackoffPolicy,
};

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_RESUME_WINDOW_MS: u64 = 60_000;
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Tuning knobs shared by the cache and the connection supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Number of channel windows kept before LRU eviction.
    pub channel_limit: usize,
    /// Messages retained per channel window.
    pub window_capacity: usize,
    /// Reconnect attempts before the session is reported as exhausted.
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Heartbeat ack deadline. `None` uses the server heartbeat interval.
    pub heartbeat_ack_timeout_ms: Option<u64>,
    /// Longest background pause that is recovered by heartbeating again
    /// instead of resuming.
    pub resume_window_ms: u64,
    /// Capacity of the outbound command queue.
    pub outbound_buffer: usize,
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let channel_limit = parse_or(
            "CHATSYNC_CHANNEL_LIMIT",
            DEFAULT_CHANNEL_LIMIT,
            &mut lookup,
        )?;
        let window_capacity = parse_or(
            "CHATSYNC_WINDOW_CAPACITY",
            DEFAULT_WINDOW_CAPACITY,
            &mut lookup,
        )?;
        let max_reconnect_attempts = parse_or(
            "CHATSYNC_MAX_RECONNECT_ATTEMPTS",
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            &mut lookup,
        )?;
        let backoff_base_ms = parse_or(
            "CHATSYNC_BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE_MS,
            &mut lookup,
        )?;
        let backoff_max_ms = parse_or(
            "CHATSYNC_BACKOFF_MAX_MS",
            DEFAULT_BACKOFF_MAX_MS,
            &mut lookup,
        )?;
        let heartbeat_ack_timeout_ms =
            parse_optional::<u64, _>("CHATSYNC_HEARTBEAT_ACK_TIMEOUT_MS", &mut lookup)?;
        let resume_window_ms = parse_or(
            "CHATSYNC_RESUME_WINDOW_MS",
            DEFAULT_RESUME_WINDOW_MS,
            &mut lookup,
        )?;
        let outbound_buffer = parse_or(
            "CHATSYNC_OUTBOUND_BUFFER",
            DEFAULT_OUTBOUND_BUFFER,
            &mut lookup,
        )?;

        require_positive("CHATSYNC_CHANNEL_LIMIT", channel_limit)?;
        require_positive("CHATSYNC_WINDOW_CAPACITY", window_capacity)?;
        require_positive("CHATSYNC_OUTBOUND_BUFFER", outbound_buffer)?;
        if heartbeat_ack_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "CHATSYNC_HEARTBEAT_ACK_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if backoff_max_ms < backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "CHATSYNC_BACKOFF_MAX_MS",
                value: backoff_max_ms.to_string(),
                reason: format!("must be at least CHATSYNC_BACKOFF_BASE_MS ({backoff_base_ms})"),
            });
        }

        Ok(Self {
            channel_limit,
            window_capacity,
            max_reconnect_attempts,
            backoff_base_ms,
            backoff_max_ms,
            heartbeat_ack_timeout_ms,
            resume_window_ms,
            outbound_buffer,
        })
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.backoff_base_ms,
            self.backoff_max_ms,
            self.max_reconnect_attempts,
        )
    }

    /// Ack deadline for a heartbeat sent with the given interval.
    pub fn heartbeat_ack_timeout(&self, heartbeat_interval: Duration) -> Duration {
        self.heartbeat_ack_timeout_ms
            .map_or(heartbeat_interval, Duration::from_millis)
    }

    pub fn resume_window(&self) -> Duration {
        Duration::from_millis(self.resume_window_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_limit: DEFAULT_CHANNEL_LIMIT,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            heartbeat_ack_timeout_ms: None,
            resume_window_ms: DEFAULT_RESUME_WINDOW_MS,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

fn require_positive(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}
