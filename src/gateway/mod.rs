//! Gateway module - WebSocket-based control plane
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Gateway Server                    │
//! │              ws://127.0.0.1:18789/ws                 │
//! └───────────────────────┬─────────────────────────────┘
//!                         │ origin check, handshake, auth
//!                         ▼
//!                ┌─────────────────┐
//!                │   Dispatcher    │──► methods (sessions, send, agent, ...)
//!                └────────┬────────┘
//!                         ▼
//!      ┌──────────┬───────┴───────┬───────────┐
//!      ▼          ▼               ▼           ▼
//!  Sessions   Delivery queue   Tools      Event bus
//! ```

pub mod auth;
pub mod core;
pub mod dispatcher;
pub mod methods;
pub mod origin;
pub mod protocol;
pub mod rate_limit;
pub mod server;

pub use self::auth::Authenticator;
pub use self::core::GatewayCore;
pub use dispatcher::{ConnectionContext, Dispatcher, Handshake, MethodHandler, MethodRegistry, PreparedCall, TypedMethod};
pub use origin::{check_browser_origin, OriginRejection};
pub use protocol::{error_codes, events, GatewayFrame, ProtocolError, PROTOCOL_VERSION};
pub use rate_limit::RateLimiter;
pub use server::{router, serve, AppState};
