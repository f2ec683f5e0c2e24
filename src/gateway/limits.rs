use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_per_window: 100,
        }
    }
}

/// Per-key fixed window. A window opens on the first call after the previous one lapsed, so
/// two adjacent windows can together admit up to twice `max_per_window` around their edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_start: u64,
    pub count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn check_and_consume(&self, key: &str, now: u64) -> Result<(), GatewayError> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(key.to_string()).or_insert(RateWindow {
            window_start: now,
            count: 0,
        });

        if now.saturating_sub(window.window_start) > self.config.window_secs {
            window.window_start = now;
            window.count = 0;
        }

        if window.count >= self.config.max_per_window {
            return Err(GatewayError::RateLimited {
                limit: format!(
                    "{} per {}s",
                    self.config.max_per_window, self.config.window_secs
                ),
            });
        }

        window.count = window.count.saturating_add(1);
        Ok(())
    }

    pub fn window(&self, key: &str) -> Option<RateWindow> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Drops windows that have lapsed. Live ones are kept so a burst cannot restart early.
    pub fn prune_expired(&self, now: u64) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        let window_secs = self.config.window_secs;
        windows.retain(|_, window| now.saturating_sub(window.window_start) <= window_secs);
        before - windows.len()
    }
}
