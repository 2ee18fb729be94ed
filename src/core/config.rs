/*!
 * Server Configuration
 *
 * Runtime knobs for the broker: poll backend, table capacities, reply sizes.
 * Read once at startup, from a JSON file and/or environment variables.
 */

use super::errors::{ServerError, ServerResult};
use super::limits::{
    DEFAULT_MAX_HANDLES, DEFAULT_REPLY_MAX_SIZE, DEFAULT_SLOW_REQUEST_MS, MIN_MAX_HANDLES,
};
use crate::reactor::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Configuration for one server instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Readiness backend (default: auto)
    pub poll_backend: BackendKind,

    /// Handle table capacity per process
    pub max_handles: usize,

    /// Default capacity for variable-length reply data
    pub reply_max_size: usize,

    /// Threshold for slow-request warnings
    pub slow_request_ms: u64,

    /// Policy given to a new debug context
    pub kill_on_exit_default: bool,
}

impl ServerConfig {
    /// Create default configuration
    pub fn new() -> Self {
        Self {
            poll_backend: BackendKind::Auto,
            max_handles: DEFAULT_MAX_HANDLES,
            reply_max_size: DEFAULT_REPLY_MAX_SIZE,
            slow_request_ms: DEFAULT_SLOW_REQUEST_MS,
            kill_on_exit_default: true,
        }
    }

    /// Small tables and the plain poll backend (testing only)
    pub fn minimal() -> Self {
        Self {
            poll_backend: BackendKind::Poll,
            max_handles: 64,
            reply_max_size: 4096,
            slow_request_ms: 1000,
            kill_on_exit_default: true,
        }
    }

    /// Load configuration from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ServerError::invalid_parameter(format!("{}: {}", path.display(), e)))
    }

    /// Build configuration from the environment
    ///
    /// Environment variables:
    /// - OBJBROKER_CONFIG: JSON file applied first
    /// - OBJBROKER_POLL_BACKEND: auto | epoll | kqueue | poll
    /// - OBJBROKER_MAX_HANDLES: per-process handle capacity
    /// - OBJBROKER_REPLY_MAX_SIZE: reply data capacity in bytes
    /// - OBJBROKER_SLOW_REQUEST_MS: slow-request warning threshold
    pub fn from_env() -> Self {
        let mut config = match std::env::var("OBJBROKER_CONFIG") {
            Ok(path) => Self::from_json_file(Path::new(&path)).unwrap_or_else(|e| {
                warn!(path = %path, error = %e, "ignoring unreadable config file");
                Self::new()
            }),
            Err(_) => Self::new(),
        };

        if let Some(kind) = env_parse::<BackendKind>("OBJBROKER_POLL_BACKEND") {
            config.poll_backend = kind;
        }
        if let Some(max) = env_parse::<usize>("OBJBROKER_MAX_HANDLES") {
            config.max_handles = max.max(MIN_MAX_HANDLES);
        }
        if let Some(size) = env_parse::<usize>("OBJBROKER_REPLY_MAX_SIZE") {
            config.reply_max_size = size;
        }
        if let Some(ms) = env_parse::<u64>("OBJBROKER_SLOW_REQUEST_MS") {
            config.slow_request_ms = ms;
        }
        config
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring invalid environment value");
            None
        }
    }
}
