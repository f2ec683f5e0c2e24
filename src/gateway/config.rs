use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::limits::RateLimitConfig;
use super::memory::MemoryConfig;
use super::state_file::{self, StateFileError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error(transparent)]
    State(#[from] StateFileError),
}

/// Which callers get retrieval augmentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub for_keys: bool,
    pub for_local: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            for_keys: true,
            for_local: false,
        }
    }
}

/// Resolved once at startup and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub base_url: String,
    pub default_model: String,
    /// Bound on one backend call.
    pub request_timeout_secs: u64,
    /// How long the endpoint waits for a keyed call before answering 408.
    pub response_wait_secs: u64,
    pub max_concurrent_requests: usize,
    pub rate_limit: RateLimitConfig,
    pub max_history: usize,
    pub snapshot_max_messages: usize,
    pub max_message_bytes: usize,
    pub key_ttl_days: u32,
    pub retrieval: RetrievalConfig,
    pub ip_allowlist: Vec<IpAddr>,
    pub ip_denylist: Vec<IpAddr>,
    pub memory: MemoryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5000".to_string(),
            base_url: "http://localhost:11434".to_string(),
            default_model: "llama2".to_string(),
            request_timeout_secs: 60,
            response_wait_secs: 75,
            max_concurrent_requests: 5,
            rate_limit: RateLimitConfig::default(),
            max_history: 20,
            snapshot_max_messages: 10,
            max_message_bytes: 5000,
            key_ttl_days: 365,
            retrieval: RetrievalConfig::default(),
            ip_allowlist: Vec::new(),
            ip_denylist: Vec::new(),
            memory: MemoryConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
        Ok(state_file::load_json(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        Ok(state_file::save_json(path, self)?)
    }

    /// Missing or unreadable files fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("request_timeout_secs", self.request_timeout_secs as usize),
            ("response_wait_secs", self.response_wait_secs as usize),
            ("max_concurrent_requests", self.max_concurrent_requests),
            ("rate_limit.window_secs", self.rate_limit.window_secs as usize),
            ("rate_limit.max_per_window", self.rate_limit.max_per_window as usize),
            ("max_history", self.max_history),
            ("snapshot_max_messages", self.snapshot_max_messages),
            ("max_message_bytes", self.max_message_bytes),
            ("key_ttl_days", self.key_ttl_days as usize),
            ("memory.check_interval_secs", self.memory.check_interval_secs as usize),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        for (field, value) in [
            ("memory.max_memory_percent", self.memory.max_memory_percent),
            ("memory.max_accelerator_percent", self.memory.max_accelerator_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn response_wait(&self) -> Duration {
        Duration::from_secs(self.response_wait_secs)
    }
}
