//! Webhook channel adapter
//!
//! Posts outbound payloads as JSON to a configured HTTP endpoint. The
//! endpoint is expected to honor the `Idempotency-Key` header.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::WebhookChannelConfig;
use crate::core::channel::{ChannelAdapter, ChannelCapabilities, DeliveryReceipt, OutboundRequest, ReplyPayload};
use crate::error::{DeliveryError, Error, Result};

/// Header carrying the dedup token
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Request body sent to the webhook
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    channel: &'a str,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
    payloads: &'a [ReplyPayload],
}

/// Optional response body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// Outbound channel backed by an HTTP webhook
pub struct WebhookChannel {
    id: String,
    url: reqwest::Url,
    token: Option<SecretString>,
    client: Client,
}

impl WebhookChannel {
    /// Create a webhook channel
    pub fn new(id: impl Into<String>, config: &WebhookChannelConfig) -> Result<Self> {
        let id = id.into();
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Invalid webhook URL for channel '{}': {}", id, e)))?;
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(WebhookChannel {
            id,
            url,
            token: config.token.clone(),
            client,
        })
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            outbound: true,
            threads: true,
            media: true,
            idempotent: true,
            max_message_length: None,
        }
    }

    async fn deliver(&self, request: &OutboundRequest) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        let body = WebhookBody {
            channel: &request.channel,
            to: &request.to,
            account_id: request.account_id.as_deref(),
            thread_id: request.thread_id.as_deref(),
            payloads: &request.payloads,
        };

        let mut builder = self.client.post(self.url.clone()).json(&body);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::transient(format!("webhook timed out: {}", e))
            } else {
                DeliveryError::transient(format!("webhook request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            let parsed: WebhookResponse = response.json().await.unwrap_or_default();
            debug!(channel = %self.id, to = %request.to, status = status.as_u16(), "webhook delivered");
            return Ok(DeliveryReceipt {
                message_id: parsed.message_id,
            });
        }

        let text = response.text().await.unwrap_or_default();
        let message = format!("webhook returned {}: {}", status, truncate(&text, 200));
        if is_transient_status(status) {
            Err(DeliveryError::transient(message))
        } else {
            Err(DeliveryError::permanent(message))
        }
    }
}

/// 408, 429 and 5xx are worth retrying; any other error status is final
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> WebhookChannelConfig {
        WebhookChannelConfig {
            url,
            token: Some(SecretString::from("relay-secret".to_string())),
            timeout: Duration::from_secs(5),
        }
    }

    fn request() -> OutboundRequest {
        OutboundRequest {
            channel: "sms".into(),
            to: "+15550100".into(),
            account_id: None,
            thread_id: None,
            payloads: vec![ReplyPayload::text("hi")],
            idempotency_key: Some("run-1:0".into()),
        }
    }

    #[tokio::test]
    async fn test_delivers_with_idempotency_key_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("Idempotency-Key", "run-1:0"))
            .and(header("Authorization", "Bearer relay-secret"))
            .and(body_partial_json(serde_json::json!({
                "channel": "sms",
                "to": "+15550100",
                "payloads": [{ "type": "text", "text": "hi" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "messageId": "m-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new("sms", &config(format!("{}/send", server.uri()))).unwrap();
        let receipt = channel.deliver(&request()).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_status_classification() {
        for (status, transient) in [(503, true), (429, true), (408, true), (400, false), (404, false)] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let channel = WebhookChannel::new("sms", &config(server.uri())).unwrap();
            let err = channel.deliver(&request()).await.unwrap_err();
            assert_eq!(err.is_transient(), transient, "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_empty_success_body_is_fine() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new("sms", &config(server.uri())).unwrap();
        let receipt = channel.deliver(&request()).await.unwrap();
        assert!(receipt.message_id.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Nothing listens on port 9 on loopback
        let channel = WebhookChannel::new("sms", &config("http://127.0.0.1:9/send".into())).unwrap();
        let err = channel.deliver(&request()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(matches!(
            WebhookChannel::new("sms", &config("not a url".into())),
            Err(Error::Config(_))
        ));
    }
}
