//! Configuration types module
//!
//! Root config plus the gateway section; the other sections live in their
//! own files.

pub mod channel;
pub mod delivery;
pub mod session;
pub mod tools;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway (RPC server, auth, throttling)
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Session store configuration
    #[serde(default)]
    pub session: session::SessionConfig,

    /// Outbound delivery queue configuration
    #[serde(default)]
    pub delivery: delivery::DeliveryConfig,

    /// Tool execution and circuit breaker configuration
    #[serde(default)]
    pub tools: tools::ToolsConfig,

    /// Channel configurations
    #[serde(default)]
    pub channels: channel::ChannelsConfig,

    /// State directory override (sessions, delivery queue)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables and files
    ///
    /// Layers, lowest to highest precedence:
    /// 1. Default values
    /// 2. Config file (if present)
    /// 3. Environment variable overrides
    pub fn from_env() -> crate::error::Result<Self> {
        crate::config::load_config()
    }

    /// Effective state directory
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(crate::config::paths::state_dir)
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Failed-auth throttling
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Browser origin policy
    #[serde(default)]
    pub control_ui: ControlUiConfig,
    /// Time allowed for the connect handshake
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Maximum inbound frame size
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    /// Per-connection buffer of pushed events
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            port: default_port(),
            bind: default_bind(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            control_ui: ControlUiConfig::default(),
            handshake_timeout: default_handshake_timeout(),
            max_payload_bytes: default_max_payload(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_port() -> u16 {
    18789
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_payload() -> usize {
    512 * 1024
}

fn default_event_buffer() -> usize {
    256
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication mode
    #[serde(default)]
    pub mode: AuthMode,
    /// Shared token (for token mode)
    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
    /// Shared password (for password mode)
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
}

/// Authentication mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication (loopback peers only)
    #[default]
    None,
    /// Password authentication
    Password,
    /// Token-based authentication
    Token,
}

/// Exponential backoff throttle for failed authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Failures before blocking starts
    #[serde(default = "default_rl_threshold")]
    pub threshold: u32,
    /// Block duration at the threshold
    #[serde(default = "default_rl_base", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Block duration cap
    #[serde(default = "default_rl_max", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Inactivity after which an identity's failures are forgotten
    #[serde(default = "default_rl_decay", with = "humantime_serde")]
    pub decay_window: Duration,
    /// Maximum identities tracked at once
    #[serde(default = "default_rl_max_tracked")]
    pub max_tracked: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            threshold: default_rl_threshold(),
            base_delay: default_rl_base(),
            max_delay: default_rl_max(),
            decay_window: default_rl_decay(),
            max_tracked: default_rl_max_tracked(),
        }
    }
}

fn default_rl_threshold() -> u32 {
    5
}

fn default_rl_base() -> Duration {
    Duration::from_secs(1)
}

fn default_rl_max() -> Duration {
    Duration::from_secs(60)
}

fn default_rl_decay() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_rl_max_tracked() -> usize {
    10_000
}

/// Browser (control UI) origin policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlUiConfig {
    /// Exact origins always accepted (e.g. `https://dash.example.com`)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Host names accepted in the Host header besides loopback
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}
