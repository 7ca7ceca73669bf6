//! Channel configuration types
//!
//! Platform integrations live outside the gateway core; the only adapter
//! configured here is the generic HTTP webhook.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// All channel configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Webhook-backed outbound channels keyed by channel id
    #[serde(default)]
    pub webhooks: HashMap<String, WebhookChannelConfig>,
    /// Pseudo-channels that receive but never deliver (e.g. `webchat`)
    #[serde(default)]
    pub inbound_only: Vec<String>,
}

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    /// Endpoint receiving outbound payloads
    pub url: String,
    /// Bearer token sent with each request
    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
    /// Request timeout
    #[serde(default = "default_webhook_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_config_defaults() {
        let config: ChannelsConfig = serde_json::from_value(serde_json::json!({
            "webhooks": { "sms": { "url": "https://relay.example.com/send" } },
            "inbound_only": ["webchat"]
        }))
        .unwrap();
        let sms = &config.webhooks["sms"];
        assert_eq!(sms.timeout, Duration::from_secs(15));
        assert!(sms.token.is_none());
        assert_eq!(config.inbound_only, vec!["webchat"]);
    }
}
