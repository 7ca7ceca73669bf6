//! Gateway Protocol - WebSocket-based control plane
//!
//! ## Protocol Overview
//!
//! - **JSON-based messages** over WebSocket
//! - **Request-response pattern** with unique message IDs
//! - **Event streaming** for agent runs and delivery outcomes
//! - **Handshake first**: `connect` negotiates the protocol version and
//!   authenticates; every other method needs a completed handshake
//!
//! ## Message Types
//!
//! - `Request`: Client-initiated requests
//! - `Response`: Server responses to requests
//! - `Event`: Server-pushed events
//! - `Error`: Errors not tied to a request (e.g. unparseable frames)

pub mod schema;
pub mod types;

pub use schema::{
    error_codes, EventFrame, GatewayFrame, ProtocolError, RequestFrame, ResponseFrame,
    MIN_SUPPORTED_PROTOCOL, PROTOCOL_VERSION,
};
pub use types::*;
