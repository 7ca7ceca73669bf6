//! Tools module - tool trait, registry and per-tool circuit breakers
//!
//! Tools are registered into a `ToolRegistry`. Every call goes through the
//! tool's circuit breaker: repeated failures open the circuit and further
//! calls are rejected with `ToolCallOutcome::CircuitOpen` until a half-open
//! probe succeeds.

mod circuit_breaker;
mod registry;
mod traits;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolCall, ToolCallOutcome, ToolResult};

#[cfg(test)]
pub(crate) use registry::testing;
