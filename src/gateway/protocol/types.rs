//! Gateway protocol types
//!
//! Request/response types for gateway methods. Every params struct is
//! closed with `deny_unknown_fields`: an extra key is a validation error,
//! never silently ignored.

use serde::{Deserialize, Serialize};

use crate::core::channel::ReplyPayload;
use crate::delivery::SendStatus;

// ============================================================================
// Handshake
// ============================================================================

/// Client identification sent with `connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientInfo {
    /// Client identifier (e.g. `cli`, `control-ui`, `telegram-adapter`)
    pub id: String,
    /// Client version
    pub version: String,
    /// Platform string
    #[serde(default)]
    pub platform: Option<String>,
    /// Client mode (`operator`, `node`, ...)
    #[serde(default)]
    pub mode: Option<String>,
}

/// Credentials presented during the handshake
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectAuth {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// `connect` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectParams {
    /// Lowest protocol version the client speaks
    pub min_protocol: u32,
    /// Highest protocol version the client speaks
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default)]
    pub auth: Option<ConnectAuth>,
    /// Capabilities the client opts into
    #[serde(default)]
    pub caps: Vec<String>,
}

/// Server identification in `hello-ok`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}

/// `connect` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    /// Always `hello-ok`
    #[serde(rename = "type")]
    pub kind: String,
    /// Negotiated protocol version
    pub protocol: u32,
    pub server: ServerInfo,
    /// Methods this gateway serves
    pub methods: Vec<String>,
    /// Events this gateway may push
    pub events: Vec<String>,
}

/// Params for methods that take none
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyParams {}

// ============================================================================
// Sessions
// ============================================================================

/// `sessions.record` params: register an inbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionsRecordParams {
    pub agent_id: String,
    pub channel: String,
    #[serde(default)]
    pub account_id: Option<String>,
    /// Sender / conversation on the channel
    pub peer: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// `sessions.record` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsRecordResult {
    pub session_key: String,
    pub session_id: String,
    pub created: bool,
}

/// `sessions.resolve` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionsResolveParams {
    pub session_key: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Broadcast-style send; never reuses a sticky thread
    #[serde(default)]
    pub announce: bool,
}

/// `sessions.list` params
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionsListParams {
    /// Restrict to one agent
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Only sessions updated within this many minutes
    #[serde(default)]
    pub active_minutes: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ============================================================================
// Delivery
// ============================================================================

/// `send` params: enqueue an outbound reply
///
/// Either `sessionKey` (target resolved from the session) or an explicit
/// `channel` + `to` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendParams {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub announce: bool,
    pub payloads: Vec<ReplyPayload>,
    /// Dedup token for retried sends
    pub idempotency_key: String,
}

/// `send` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    /// Queue entry id
    pub id: String,
    /// Outcome of the inline attempt
    pub status: SendStatus,
    pub channel: String,
    pub to: String,
}

// ============================================================================
// Agent
// ============================================================================

/// `agent` params: start an agent run for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentParams {
    pub session_key: String,
    pub message: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub announce: bool,
    /// Caller-chosen run id; generated when absent
    #[serde(default)]
    pub run_id: Option<String>,
}

/// `agent` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAccepted {
    pub run_id: String,
    pub status: String,
}

/// `chat.abort` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "camelCase", deny_unknown_fields)]
pub enum ChatAbortParams {
    /// Abort one run
    #[serde(rename_all = "camelCase")]
    Run { run_id: String },
    /// Abort whatever run currently owns the session
    #[serde(rename_all = "camelCase")]
    Session { session_key: String },
}

/// `chat.abort` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortResult {
    /// False when nothing was running (abort is idempotent)
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

// ============================================================================
// Events
// ============================================================================

/// Event names
pub mod events {
    /// Agent run event (lifecycle, assistant, tool, error streams)
    pub const AGENT: &str = "agent";
    /// Server shutting down
    pub const SHUTDOWN: &str = "shutdown";

    /// All events the gateway may push
    pub fn all() -> Vec<String> {
        vec![AGENT.into(), SHUTDOWN.into()]
    }
}
