//! Session store configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Rotate `sessions.json` once it grows past this many bytes
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
    /// Rotated backups to keep
    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,
    /// Sessions updated within this window count as fresh
    #[serde(default = "default_fresh_within", with = "humantime_serde")]
    pub fresh_within: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            rotate_bytes: default_rotate_bytes(),
            keep_backups: default_keep_backups(),
            fresh_within: default_fresh_within(),
        }
    }
}

fn default_rotate_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_keep_backups() -> usize {
    3
}

fn default_fresh_within() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
