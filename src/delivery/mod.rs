//! Delivery - durable, at-least-once outbound delivery
//!
//! - queue.rs: one JSON record per entry, dead-letter directory
//! - backoff.rs: retry schedule
//! - recovery.rs: budgeted recovery pass without head-of-line blocking
//! - service.rs: inline send path and background worker

pub mod backoff;
pub mod queue;
pub mod recovery;
pub mod service;

pub use backoff::Backoff;
pub use queue::{DeliveryQueue, QueuedDelivery};
pub use recovery::{run_recovery_pass, Deliverer, InFlight, RecoveryPolicy, RecoverySummary};
pub use service::{ChannelDeliverer, DeliveryService, QueueStatus, SendStatus};
