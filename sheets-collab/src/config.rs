//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Exponential backoff for reconnection after abnormal closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Consecutive abnormal closes after which the client gives up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, for the zero-based retry `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Collaboration client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Base WebSocket URL of the collaboration authority
    pub server_url: String,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    pub reconnect: ReconnectPolicy,
    /// Buffered events per subscriber before the oldest are dropped
    pub event_capacity: usize,
    /// Outbound frames buffered between `send` and the channel writer
    pub outbound_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            heartbeat_interval_secs: 30,
            reconnect: ReconnectPolicy::default(),
            event_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

impl CollabConfig {
    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Parsed base URL. Only `ws` and `wss` are accepted.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.server_url, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidUrl(format!(
                "{}: unsupported scheme `{}`",
                self.server_url, other
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("heartbeat_interval_secs must be positive"));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue("reconnect.base_delay_ms must be positive"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidValue(
                "reconnect.max_delay_ms must not be below base_delay_ms",
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("reconnect.max_attempts must be positive"));
        }
        if self.event_capacity == 0 || self.outbound_capacity == 0 {
            return Err(ConfigError::InvalidValue("channel capacities must be positive"));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}
