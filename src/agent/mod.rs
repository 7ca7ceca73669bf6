//! Agent module - runtime collaborator and run orchestration
//!
//! - runtime.rs: `AgentRuntime` trait and the per-run `RunHandle`
//! - runner.rs: resolve target, drive the run, enqueue replies

mod runner;
mod runtime;

pub use runner::{AgentRunParams, AgentRunner, RunReport, RunStatus};
pub use runtime::{AgentRunOutput, AgentRunRequest, AgentRuntime, RunHandle};
