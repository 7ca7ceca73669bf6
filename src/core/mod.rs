//! Core module - fundamental traits shared by every subsystem
//!
//! - [`channel`]: outbound channel adapters and their registry
//! - [`clock`]: injectable time source

pub mod channel;
pub mod clock;

pub use channel::{
    ChannelAdapter, ChannelCapabilities, ChannelRegistry, DeliveryReceipt, DeliveryTarget, InboundOnlyChannel,
    OutboundRequest, ReplyPayload,
};
pub use clock::{Clock, ManualClock, SystemClock};
