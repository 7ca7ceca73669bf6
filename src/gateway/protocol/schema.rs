//! Wire envelope
//!
//! Every WebSocket text frame is one JSON object tagged by `type`. Clients
//! send `request` and `ping`; the gateway answers with `response`, `pong`
//! or a bare `error` when no request id could be recovered, and pushes
//! `event` frames once the handshake is done.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version spoken by this gateway
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version still accepted during the handshake
pub const MIN_SUPPORTED_PROTOCOL: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayFrame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
    Error(ErrorFrame),
    Ping { id: String },
    Pong { id: String },
}

/// Client request. The envelope is closed: a field besides `id`, `method`
/// and `params` fails the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Reply to a request; exactly one of `result` and `error` is set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
}

impl ResponseFrame {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        ResponseFrame {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ProtocolError) -> Self {
        ResponseFrame {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }
}

/// Server push
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub event: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Unix milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl EventFrame {
    /// Gateway-level event stamped with the wall clock
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        EventFrame {
            event: event.into(),
            data,
            session_key: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }
}

/// Error not tied to a parseable request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: ProtocolError,
}

/// Error shape sent to clients. Built from [`crate::error::Error`] via
/// `to_protocol_error`, never from raw handler messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC style codes; gateway-specific ones count down from -32000
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const AUTH_REQUIRED: i32 = -32000;
    pub const AUTH_FAILED: i32 = -32001;
    pub const RATE_LIMITED: i32 = -32002;
    pub const CHANNEL_NOT_AVAILABLE: i32 = -32004;
    pub const NO_DELIVERY_TARGET: i32 = -32005;
    /// Tool circuit open
    pub const TOOL_UNAVAILABLE: i32 = -32006;
}

impl ProtocolError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ProtocolError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    pub fn auth_required() -> Self {
        Self::new(error_codes::AUTH_REQUIRED, "Authentication required")
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(error_codes::AUTH_FAILED, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trips_with_type_tag() {
        let raw = r#"{"type":"request","id":"1","method":"sessions.resolve","params":{"sessionKey":"agent:main:main"}}"#;
        match serde_json::from_str::<GatewayFrame>(raw).unwrap() {
            GatewayFrame::Request(req) => {
                assert_eq!(req.method, "sessions.resolve");
                assert_eq!(req.params["sessionKey"], "agent:main:main");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_envelope_rejects_extra_fields() {
        let raw = r#"{"type":"request","id":"1","method":"health","params":{},"admin":true}"#;
        assert!(serde_json::from_str::<GatewayFrame>(raw).is_err());
    }

    #[test]
    fn test_response_carries_either_result_or_error() {
        let ok = serde_json::to_value(GatewayFrame::Response(ResponseFrame::success("1", json!({ "ok": true })))).unwrap();
        assert_eq!(ok["type"], "response");
        assert_eq!(ok["result"]["ok"], true);
        assert!(ok.get("error").is_none());

        let failed = serde_json::to_value(ResponseFrame::error(
            "2",
            ProtocolError::new(error_codes::RATE_LIMITED, "slow down").with_data(json!({ "retryAfterMs": 10 })),
        ))
        .unwrap();
        assert!(failed.get("result").is_none());
        assert_eq!(failed["error"]["code"], error_codes::RATE_LIMITED);
        assert_eq!(failed["error"]["data"]["retryAfterMs"], 10);
    }
}
