//! # OpenGate
//!
//! Resilience core of a multi-channel control gateway for AI agent backends.
//!
//! ## Features
//!
//! - **Authenticated WebSocket control plane:** versioned handshake, token or
//!   password auth, exponential throttling of failed attempts
//! - **Sticky session routing:** replies follow the channel, recipient and
//!   thread the conversation came from
//! - **Durable delivery:** outbound messages are persisted before sending and
//!   retried with backoff across restarts
//! - **Tool circuit breakers:** failing tools are skipped instead of stalling
//!   agent runs
//! - **Agent event stream:** per-run ordered events with cancellation

pub mod agent;
pub mod channels;
pub mod config;
pub mod core;
pub mod delivery;
pub mod error;
pub mod events;
pub mod gateway;
pub mod sessions;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
