//! Channels - outbound adapters built from configuration
//!
//! Platform integrations live outside the gateway core. The generic webhook
//! adapter covers any platform relay that accepts JSON over HTTP.

pub mod webhook;

pub use webhook::WebhookChannel;

use std::sync::Arc;

use tracing::info;

use crate::config::ChannelsConfig;
use crate::core::channel::{ChannelRegistry, InboundOnlyChannel};
use crate::error::Result;

/// Build the channel registry from configuration
pub fn build_registry(config: &ChannelsConfig) -> Result<ChannelRegistry> {
    let mut registry = ChannelRegistry::new();
    for (id, webhook) in &config.webhooks {
        registry.register(Arc::new(WebhookChannel::new(id.clone(), webhook)?));
        info!(channel = %id, "webhook channel registered");
    }
    for id in &config.inbound_only {
        registry.register(Arc::new(InboundOnlyChannel::new(id.clone())));
    }
    Ok(registry)
}
