//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;

use secrecy::SecretString;

use super::types::{AuthMode, Config};
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    // Apply environment variable overrides (highest precedence)
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().map_or(false, |ext| ext == "json") {
        // Parse as JSON5 (more lenient than strict JSON)
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().map_or(false, |ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays any set variables.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`
pub(crate) fn apply_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Auth overrides
    if let Some(token) = lookup("OPENGATE_GATEWAY_TOKEN") {
        config.gateway.auth.token = Some(SecretString::from(token));
        if config.gateway.auth.mode == AuthMode::None {
            config.gateway.auth.mode = AuthMode::Token;
        }
    }
    if let Some(password) = lookup("OPENGATE_GATEWAY_PASSWORD") {
        config.gateway.auth.password = Some(SecretString::from(password));
        if config.gateway.auth.mode == AuthMode::None {
            config.gateway.auth.mode = AuthMode::Password;
        }
    }
    if let Some(mode) = lookup("OPENGATE_AUTH_MODE") {
        match mode.trim().to_ascii_lowercase().as_str() {
            "none" => config.gateway.auth.mode = AuthMode::None,
            "token" => config.gateway.auth.mode = AuthMode::Token,
            "password" => config.gateway.auth.mode = AuthMode::Password,
            other => tracing::warn!("Ignoring unknown OPENGATE_AUTH_MODE '{}'", other),
        }
    }

    // Gateway overrides
    if let Some(port) = lookup("OPENGATE_PORT") {
        if let Ok(port) = port.parse() {
            config.gateway.port = port;
        }
    }
    if let Some(bind) = lookup("OPENGATE_BIND") {
        config.gateway.bind = bind;
    }

    // State directory override
    if let Some(dir) = lookup("OPENGATE_STATE_DIR") {
        config.state_dir = Some(std::path::PathBuf::from(dir));
    }
}

/// Save configuration to a file
///
/// Secrets are never written.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().map_or(false, |ext| ext == "toml") {
        toml::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_config.json");

        let mut config = Config::default();
        config.gateway.port = 19000;
        config.gateway.auth.token = Some(SecretString::from("s3cret".to_string()));
        save_config(&config, &path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("s3cret"));

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.gateway.port, 19000);
        assert!(loaded.gateway.auth.token.is_none());
    }

    #[test]
    fn test_load_json5_with_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // lenient syntax
                gateway: { port: 20000, auth: { mode: "token", token: "abc" } },
                delivery: { max_recovery: "2m" },
            }"#,
        )
        .unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.gateway.port, 20000);
        assert_eq!(config.gateway.auth.mode, AuthMode::Token);
        assert_eq!(
            config.gateway.auth.token.as_ref().unwrap().expose_secret(),
            "abc"
        );
        assert_eq!(config.delivery.max_recovery.as_secs(), 120);
    }

    #[test]
    fn test_load_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 21000\n[tools.circuit]\nopen_duration = \"45s\"\n").unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.gateway.port, 21000);
        assert_eq!(config.tools.circuit.open_duration.as_secs(), 45);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OPENGATE_GATEWAY_TOKEN", "tok"),
            ("OPENGATE_PORT", "9999"),
            ("OPENGATE_STATE_DIR", "/tmp/opengate-state"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_overrides_from(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.gateway.auth.mode, AuthMode::Token);
        assert_eq!(config.gateway.port, 9999);
        assert_eq!(
            config.state_dir.as_deref(),
            Some(std::path::Path::new("/tmp/opengate-state"))
        );
    }
}
