//! Configuration paths
//!
//! Utilities for resolving configuration and state paths.

use std::path::{Path, PathBuf};

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("OPENGATE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG config directory or fallback
    dirs::config_dir()
        .map(|d| d.join("opengate"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("opengate"))
                .unwrap_or_else(|| PathBuf::from(".opengate"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var("OPENGATE_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

/// Get the state directory (sessions, delivery queue)
pub fn state_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("OPENGATE_STATE_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG data directory or fallback
    dirs::data_dir()
        .map(|d| d.join("opengate"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local").join("share").join("opengate"))
                .unwrap_or_else(|| PathBuf::from(".opengate"))
        })
}

/// Session store file for one agent
pub fn sessions_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir
        .join("agents")
        .join(agent_id)
        .join("sessions")
        .join("sessions.json")
}

/// Root of the per-agent partitions
pub fn agents_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("agents")
}

/// Outbound delivery queue directory
pub fn delivery_queue_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("delivery-queue")
}

/// Dead-letter directory for dropped deliveries
pub fn delivery_failed_dir(state_dir: &Path) -> PathBuf {
    delivery_queue_dir(state_dir).join("failed")
}
