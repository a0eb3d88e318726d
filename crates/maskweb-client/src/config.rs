//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client starts with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use maskweb_net::ReconnectPolicy;
use maskweb_shared::constants::{
    DEFAULT_WS_PATH, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_SECS, REQUEST_TIMEOUT_SECS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// SQLite file holding the registry and the media cache.
    /// Env: `MASKWEB_DB_PATH`
    /// Default: `None`, meaning the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Env: `MASKWEB_RECONNECT_ATTEMPTS`
    /// Default: `5`
    pub reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts.
    /// Env: `MASKWEB_RECONNECT_DELAY_SECS`
    /// Default: 10 s
    pub reconnect_delay: Duration,

    /// Env: `MASKWEB_REQUEST_TIMEOUT_SECS`
    /// Default: 30 s
    pub request_timeout: Duration,

    /// Messaging endpoint path appended to each server's base address.
    /// Env: `MASKWEB_WS_PATH`
    /// Default: `/ws`
    pub ws_path: String,

    /// Registered on start when the persisted registry is empty.
    /// Env: `MASKWEB_DEFAULT_SERVER`
    pub default_server: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            ws_path: DEFAULT_WS_PATH.to_string(),
            default_server: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("MASKWEB_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(val) = lookup("MASKWEB_RECONNECT_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) => config.reconnect_attempts = n,
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid MASKWEB_RECONNECT_ATTEMPTS, using default"
                ),
            }
        }

        if let Some(val) = lookup("MASKWEB_RECONNECT_DELAY_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.reconnect_delay = Duration::from_secs(secs),
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid MASKWEB_RECONNECT_DELAY_SECS, using default"
                ),
            }
        }

        if let Some(val) = lookup("MASKWEB_REQUEST_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid MASKWEB_REQUEST_TIMEOUT_SECS, using default"
                ),
            }
        }

        if let Some(path) = lookup("MASKWEB_WS_PATH") {
            if path.starts_with('/') {
                config.ws_path = path;
            } else {
                tracing::warn!(value = %path, "MASKWEB_WS_PATH must start with '/', using default");
            }
        }

        if let Some(url) = lookup("MASKWEB_DEFAULT_SERVER").filter(|u| !u.is_empty()) {
            config.default_server = Some(url);
        }

        config
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            delay: self.reconnect_delay,
        }
    }
}
