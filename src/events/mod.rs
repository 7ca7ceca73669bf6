//! Events - agent event bus and run registry

pub mod bus;

pub use bus::{AgentEvent, AgentEventBus, EventStream, RunContext, Subscription};
