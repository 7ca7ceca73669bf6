//! Channel adapter trait - Abstract interface for outbound messaging platforms
//!
//! A channel adapter is the only component that actually puts bytes on the
//! wire for a platform. The gateway core never talks to a platform directly:
//! it hands an [`OutboundRequest`] to the adapter registered for the channel.
//!
//! Channels are registered in a [`ChannelRegistry`]. Only adapters whose
//! capabilities declare `outbound` are deliverable; read-only and internal
//! pseudo-channels can be registered for bookkeeping but are never chosen as
//! delivery targets.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DeliveryError;

/// Unique identifier for a channel type
pub type ChannelId = String;

/// Capabilities supported by a channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCapabilities {
    /// Can send outbound messages
    pub outbound: bool,
    /// Supports threads/topics
    pub threads: bool,
    /// Supports media payloads
    pub media: bool,
    /// Honors idempotency keys (dedups retried sends)
    pub idempotent: bool,
    /// Maximum message length
    pub max_message_length: Option<usize>,
}

impl ChannelCapabilities {
    /// Capabilities of a receive-only or internal pseudo-channel
    pub fn inbound_only() -> Self {
        ChannelCapabilities::default()
    }
}

/// One content block of an outbound reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ReplyPayload {
    /// Plain text
    Text { text: String },
    /// Media attachment with optional caption
    Media {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ReplyPayload {
    /// Create a text payload
    pub fn text(text: impl Into<String>) -> Self {
        ReplyPayload::Text { text: text.into() }
    }

    /// Get the text content if this is a text payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ReplyPayload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Resolved (channel, recipient, account, thread) tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTarget {
    pub channel: ChannelId,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Request handed to a channel adapter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub channel: ChannelId,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub payloads: Vec<ReplyPayload>,
    /// Dedup token for adapters that support it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Acknowledgement from a channel adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Platform message id, when the platform returns one
    pub message_id: Option<String>,
}

/// Abstract interface for outbound channel adapters
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Get the channel ID
    fn id(&self) -> &str;

    /// Get channel capabilities
    fn capabilities(&self) -> ChannelCapabilities;

    /// Send payloads to a recipient.
    ///
    /// Must report failure distinctly from a slow success; transient and
    /// permanent failures are distinguished through [`DeliveryError`].
    async fn deliver(
        &self,
        request: &OutboundRequest,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError>;
}

/// Registry of known channel adapters
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    adapters: HashMap<ChannelId, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        ChannelRegistry {
            adapters: HashMap::new(),
        }
    }

    /// Register a channel adapter
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    /// Get an adapter by channel id
    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel).cloned()
    }

    /// Whether the channel may be used as a delivery target
    pub fn is_deliverable(&self, channel: &str) -> bool {
        self.adapters
            .get(channel)
            .map(|a| a.capabilities().outbound)
            .unwrap_or(false)
    }

    /// Get an adapter only if it is deliverable
    pub fn deliverable(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.get(channel).filter(|a| a.capabilities().outbound)
    }

    /// List channel ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Receive-only or internal pseudo-channel that can never be a delivery target
pub struct InboundOnlyChannel {
    id: String,
}

impl InboundOnlyChannel {
    pub fn new(id: impl Into<String>) -> Self {
        InboundOnlyChannel { id: id.into() }
    }
}

#[async_trait]
impl ChannelAdapter for InboundOnlyChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::inbound_only()
    }

    async fn deliver(
        &self,
        _request: &OutboundRequest,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        Err(DeliveryError::permanent(format!(
            "channel '{}' does not support outbound delivery",
            self.id
        )))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_payload_text() {
        let payload = ReplyPayload::text("Hello, world!");
        assert_eq!(payload.as_text(), Some("Hello, world!"));
    }

    #[test]
    fn test_reply_payload_rejects_unknown_fields() {
        let ok: ReplyPayload = serde_json::from_str(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert_eq!(ok, ReplyPayload::text("hi"));
        assert!(serde_json::from_str::<ReplyPayload>(r#"{"type":"text","text":"hi","html":"<b>"}"#).is_err());
    }

    #[test]
    fn test_inbound_only_channel_is_not_deliverable() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(InboundOnlyChannel::new("webchat")));
        registry.register(testing::RecordingChannel::new("telegram"));

        assert!(registry.is_deliverable("telegram"));
        assert!(!registry.is_deliverable("webchat"));
        assert!(!registry.is_deliverable("unknown"));
        assert!(registry.deliverable("webchat").is_none());
        assert_eq!(registry.ids(), vec!["telegram", "webchat"]);
    }
}
