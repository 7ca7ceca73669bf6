//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::{AuthMode, Config};
use super::types::tools::CircuitBreakerConfig;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_gateway_config(config, result);
    result = validate_delivery_config(config, result);
    result = validate_circuit_config("tools.circuit", &config.tools.circuit, result);
    for (tool, overrides) in &config.tools.overrides {
        result = validate_circuit_config(&format!("tools.overrides.{}", tool), overrides, result);
    }
    result = validate_channel_config(config, result);

    result
}

fn validate_gateway_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let auth = &config.gateway.auth;

    match auth.mode {
        AuthMode::Token if auth.token.is_none() => {
            result = result.with_error(
                ValidationIssue::new("gateway.auth.token", "Token auth selected but no token configured")
                    .with_suggestion("Set OPENGATE_GATEWAY_TOKEN or gateway.auth.token"),
            );
        }
        AuthMode::Password if auth.password.is_none() => {
            result = result.with_error(
                ValidationIssue::new(
                    "gateway.auth.password",
                    "Password auth selected but no password configured",
                )
                .with_suggestion("Set OPENGATE_GATEWAY_PASSWORD or gateway.auth.password"),
            );
        }
        AuthMode::None if !is_loopback_bind(&config.gateway.bind) => {
            result = result.with_error(
                ValidationIssue::new(
                    "gateway.bind",
                    format!(
                        "Refusing to bind {} without authentication",
                        config.gateway.bind
                    ),
                )
                .with_suggestion("Bind 127.0.0.1 or configure token/password auth"),
            );
        }
        _ => {}
    }

    let rl = &config.gateway.rate_limit;
    if rl.threshold == 0 {
        result = result.with_error(ValidationIssue::new(
            "gateway.rate_limit.threshold",
            "Threshold must be at least 1",
        ));
    }
    if rl.base_delay > rl.max_delay {
        result = result.with_warning(ValidationIssue::new(
            "gateway.rate_limit.base_delay",
            "Base delay exceeds max delay; every block will use max delay",
        ));
    }

    result
}

fn validate_delivery_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let delivery = &config.delivery;

    if delivery.max_retries == 0 {
        result = result.with_error(ValidationIssue::new(
            "delivery.max_retries",
            "At least one delivery attempt is required",
        ));
    }
    if delivery.backoff_factor == 0 {
        result = result.with_error(ValidationIssue::new(
            "delivery.backoff_factor",
            "Backoff factor must be at least 1",
        ));
    }
    if delivery.attempt_timeout > delivery.max_recovery {
        result = result.with_warning(
            ValidationIssue::new(
                "delivery.attempt_timeout",
                "Attempt timeout exceeds the recovery budget; attempts will be cut short",
            )
            .with_suggestion("Lower attempt_timeout or raise max_recovery"),
        );
    }

    result
}

fn validate_circuit_config(
    path: &str,
    circuit: &CircuitBreakerConfig,
    mut result: ConfigValidationResult,
) -> ConfigValidationResult {
    if circuit.consecutive_failure_threshold == 0 {
        result = result.with_error(ValidationIssue::new(
            format!("{}.consecutive_failure_threshold", path),
            "Threshold must be at least 1",
        ));
    }
    if !(circuit.failure_rate_threshold > 0.0 && circuit.failure_rate_threshold <= 1.0) {
        result = result.with_error(ValidationIssue::new(
            format!("{}.failure_rate_threshold", path),
            "Failure rate threshold must be in (0, 1]",
        ));
    }
    if circuit.half_open_probe_count == 0 {
        result = result.with_error(ValidationIssue::new(
            format!("{}.half_open_probe_count", path),
            "At least one half-open probe is required",
        ));
    }
    if circuit.half_open_success_threshold > circuit.half_open_probe_count {
        result = result.with_error(
            ValidationIssue::new(
                format!("{}.half_open_success_threshold", path),
                "Success threshold exceeds the number of half-open probes; the circuit could never close",
            )
            .with_suggestion("Keep half_open_success_threshold <= half_open_probe_count"),
        );
    }

    result
}

fn validate_channel_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.channels.webhooks.is_empty() {
        result = result.with_warning(
            ValidationIssue::new(
                "channels.webhooks",
                "No outbound channel configured. Queued replies will wait until an adapter is registered.",
            )
            .with_suggestion("Configure at least one channels.webhooks entry"),
        );
    }

    for (id, webhook) in &config.channels.webhooks {
        if url::Url::parse(&webhook.url).is_err() {
            result = result.with_error(ValidationIssue::new(
                format!("channels.webhooks.{}.url", id),
                format!("Invalid URL: {}", webhook.url),
            ));
        }
        if config.channels.inbound_only.contains(id) {
            result = result.with_error(ValidationIssue::new(
                format!("channels.webhooks.{}", id),
                "Channel is listed both as outbound webhook and inbound-only",
            ));
        }
    }

    result
}

fn is_loopback_bind(bind: &str) -> bool {
    bind.eq_ignore_ascii_case("localhost")
        || bind
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::channel::WebhookChannelConfig;
    use std::time::Duration;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        let result = validate_config(&config);

        // Default config should have warnings but no errors
        assert!(result.errors.is_empty());
        assert!(result.valid);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_token_mode_requires_token() {
        let mut config = Config::default();
        config.gateway.auth.mode = AuthMode::Token;
        let result = validate_config(&config);
        assert!(!result.valid);
        assert_eq!(result.errors[0].path, "gateway.auth.token");
    }

    #[test]
    fn test_public_bind_requires_auth() {
        let mut config = Config::default();
        config.gateway.bind = "0.0.0.0".to_string();
        let result = validate_config(&config);
        assert!(result.errors.iter().any(|e| e.path == "gateway.bind"));
    }

    #[test]
    fn test_unreachable_half_open_threshold_is_rejected() {
        let mut config = Config::default();
        let mut strict = CircuitBreakerConfig::default();
        strict.half_open_probe_count = 1;
        strict.half_open_success_threshold = 2;
        config.tools.overrides.insert("shell".into(), strict);

        let result = validate_config(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.path == "tools.overrides.shell.half_open_success_threshold"));
    }

    #[test]
    fn test_bad_webhook_url() {
        let mut config = Config::default();
        config.channels.webhooks.insert(
            "sms".into(),
            WebhookChannelConfig {
                url: "not a url".into(),
                token: None,
                timeout: Duration::from_secs(5),
            },
        );
        let result = validate_config(&config);
        assert!(result.errors.iter().any(|e| e.path == "channels.webhooks.sms.url"));
    }
}
