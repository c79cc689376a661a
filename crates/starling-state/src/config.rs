use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the shared state store.
///
/// Every field has a serde default, so a config can be deserialized from a
/// partial TOML or JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Lock acquisition attempts before giving up (default: 3).
    ///
    /// At least one attempt is always made, even when set to 0.
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,

    /// Delay between lock attempts in milliseconds (default: 2).
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,

    /// Age in milliseconds past which a held lock is presumed abandoned
    /// (default: 25).
    #[serde(default = "default_stale_lock_timeout_ms")]
    pub stale_lock_timeout_ms: u64,

    /// Watchdog tick in milliseconds (default: 5). Set to 0 to disable the
    /// watchdog entirely.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
}

fn default_lock_retry_attempts() -> u32 {
    3
}

fn default_lock_retry_delay_ms() -> u64 {
    2
}

fn default_stale_lock_timeout_ms() -> u64 {
    25
}

fn default_watchdog_interval_ms() -> u64 {
    5
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            stale_lock_timeout_ms: default_stale_lock_timeout_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
        }
    }
}

impl StateConfig {
    /// Delay between lock attempts as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    /// Stale-lock threshold as a [`Duration`].
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_lock_timeout_ms)
    }

    /// Watchdog tick as a [`Duration`].
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}
