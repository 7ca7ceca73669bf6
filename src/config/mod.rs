//! Configuration module - Modular configuration management
//!
//! - types/mod.rs: Root config, gateway/auth/rate-limit settings
//! - types/session.rs: Session store settings
//! - types/delivery.rs: Delivery queue settings
//! - types/tools.rs: Tool timeouts and circuit breaker thresholds
//! - types/channel.rs: Outbound channel settings
//! - io.rs: Configuration loading and saving
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration and state paths

mod io;
pub mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{AuthConfig, AuthMode, Config, ControlUiConfig, GatewayConfig, RateLimitConfig};

// Re-export section types
pub use types::channel::{ChannelsConfig, WebhookChannelConfig};
pub use types::delivery::DeliveryConfig;
pub use types::session::SessionConfig;
pub use types::tools::{CircuitBreakerConfig, ToolsConfig};

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{config_dir, config_path, state_dir};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
