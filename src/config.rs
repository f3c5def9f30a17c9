//! Session configuration.
//!
//! Read from the environment (after `.env` has been loaded):
//! - `STREAMCACHE_WS_URL` - push endpoint
//! - `STREAMCACHE_API_URL` - HTTP data layer base URL
//! - `STREAMCACHE_RECONNECT_DELAY_MS` - fixed delay between reconnect attempts
//! - `STREAMCACHE_MAX_RECONNECTS` - consecutive failures before giving up
//! - `STREAMCACHE_COALESCE_MS` - invalidation coalescing window

use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportConfig;

/// Errors that can occur while building a configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of a `SyncSession`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// WebSocket URL of the push endpoint
    pub ws_url: String,
    /// Base URL of the HTTP data layer
    pub api_url: String,
    /// Fixed delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Consecutive failed connection attempts tolerated
    pub max_reconnect_attempts: u32,
    /// Length of the invalidation coalescing window
    pub coalesce_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:5000/ws".to_string(),
            api_url: "http://localhost:5000/api".to_string(),
            reconnect_delay: Duration::from_millis(5000),
            max_reconnect_attempts: 5,
            coalesce_window: Duration::from_millis(300),
        }
    }
}

impl SessionConfig {
    pub fn new(ws_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    /// Create from environment variables; unset variables keep their defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("STREAMCACHE_WS_URL") {
            config.ws_url = url;
        }
        if let Some(url) = lookup("STREAMCACHE_API_URL") {
            config.api_url = url;
        }
        if let Some(ms) = parse_var(&lookup, "STREAMCACHE_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, "STREAMCACHE_MAX_RECONNECTS")? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = parse_var(&lookup, "STREAMCACHE_COALESCE_MS")? {
            config.coalesce_window = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_url.is_empty() {
            return Err(ConfigError::Invalid("WebSocket URL is empty".to_string()));
        }
        if self.api_url.is_empty() {
            return Err(ConfigError::Invalid("API URL is empty".to_string()));
        }
        if self.coalesce_window.is_zero() {
            return Err(ConfigError::Invalid("Coalescing window must be positive".to_string()));
        }
        Ok(())
    }

    /// Reconnect policy for the transport manager
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(None),
    }
}
