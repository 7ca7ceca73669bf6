//! Sessions - conversational continuity and delivery target resolution
//!
//! - key.rs: stable session key derivation
//! - store.rs: per-agent JSON store with atomic single-writer updates
//! - directory.rs: session to delivery target resolution

pub mod directory;
pub mod key;
pub mod store;

pub use directory::{InboundRoute, ListFilter, RecordedSession, SessionDirectory, SessionSummary, TargetRequest};
pub use key::session_key;
pub use store::{DeliveryContext, SessionEntry, SessionStore};
