//! Error types for OpenGate

use thiserror::Error;

use crate::gateway::protocol::schema::{error_codes, ProtocolError};

/// Result type alias using OpenGate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for OpenGate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed envelope or handshake that cannot be negotiated
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No handler registered under the method name
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Method needs a completed handshake
    #[error("Authentication required")]
    AuthRequired,

    /// Request parameters failed schema validation
    #[error("Invalid params: {0}")]
    Validation(String),

    /// Unauthorized access
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is throttled by the auth rate limiter
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// No deliverable target could be resolved for a session
    #[error("No delivery target: {0}")]
    NoDeliveryTarget(String),

    /// Channel is not registered or cannot send outbound messages
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Channel adapter failed to deliver
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// Tool call rejected because its circuit is open
    #[error("Tool '{tool}' is temporarily unavailable")]
    CircuitOpen {
        tool: String,
        retry_after_ms: Option<u64>,
    },

    /// A persisted record could not be read back
    #[error("Corrupt store {path}: {message}")]
    StoreCorruption { path: String, message: String },

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Delivery(e) => e.is_transient(),
            Error::Http(_)
            | Error::RateLimited { .. }
            | Error::CircuitOpen { .. }
            | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Map to the error shape sent to remote peers.
    ///
    /// Only whitelisted kinds keep their message; everything else collapses
    /// into a generic internal error so handler internals never reach the wire.
    pub fn to_protocol_error(&self) -> ProtocolError {
        match self {
            Error::Protocol(msg) => ProtocolError::invalid_request(msg.clone()),
            Error::MethodNotFound(method) => ProtocolError::method_not_found(method),
            Error::AuthRequired => ProtocolError::auth_required(),
            Error::Validation(msg) => ProtocolError::new(error_codes::INVALID_PARAMS, msg.clone()),
            Error::Unauthorized(_) => ProtocolError::auth_failed("unauthorized"),
            Error::RateLimited { retry_after_ms } => {
                ProtocolError::new(error_codes::RATE_LIMITED, "too many failed attempts")
                    .with_data(serde_json::json!({ "retryAfterMs": retry_after_ms }))
            }
            Error::NoDeliveryTarget(msg) => {
                ProtocolError::new(error_codes::NO_DELIVERY_TARGET, msg.clone())
            }
            Error::ChannelUnavailable(channel) => ProtocolError::new(
                error_codes::CHANNEL_NOT_AVAILABLE,
                format!("channel not available: {}", channel),
            ),
            Error::CircuitOpen {
                tool,
                retry_after_ms,
            } => ProtocolError::new(
                error_codes::TOOL_UNAVAILABLE,
                format!("tool '{}' is temporarily unavailable", tool),
            )
            .with_data(serde_json::json!({ "retryAfterMs": retry_after_ms })),
            _ => ProtocolError::internal("internal error"),
        }
    }
}

/// Whether a failed delivery is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailureKind {
    /// Network/channel hiccup, retry with backoff
    Transient,
    /// Invalid recipient or rejected payload, never retried
    Permanent,
}

/// Failure reported by a channel adapter
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DeliveryError {
    pub kind: DeliveryFailureKind,
    pub message: String,
}

impl DeliveryError {
    /// Create a transient failure
    pub fn transient(message: impl Into<String>) -> Self {
        DeliveryError {
            kind: DeliveryFailureKind::Transient,
            message: message.into(),
        }
    }

    /// Create a permanent failure
    pub fn permanent(message: impl Into<String>) -> Self {
        DeliveryError {
            kind: DeliveryFailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == DeliveryFailureKind::Transient
    }
}
