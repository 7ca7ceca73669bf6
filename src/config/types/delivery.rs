//! Delivery queue configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outbound delivery queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Wall-clock budget for one recovery pass
    #[serde(default = "default_max_recovery", with = "humantime_serde")]
    pub max_recovery: Duration,
    /// Timeout for a single delivery attempt
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Interval between background recovery passes
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Attempts before an entry is moved to the failed directory
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Multiplier applied per additional retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    /// Retry delay cap
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            max_recovery: default_max_recovery(),
            attempt_timeout: default_attempt_timeout(),
            poll_interval: default_poll_interval(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_factor: default_backoff_factor(),
            backoff_max: default_backoff_max(),
        }
    }
}

fn default_max_recovery() -> Duration {
    Duration::from_secs(60)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_factor() -> u32 {
    5
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(10 * 60)
}
