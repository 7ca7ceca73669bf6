//! Agent runtime collaborator
//!
//! The gateway does not run models itself. An [`AgentRuntime`] receives a
//! normalized message plus a [`RunHandle`] for emitting events and calling
//! tools, and returns the payloads to deliver.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::channel::ReplyPayload;
use crate::error::Result;
use crate::events::{AgentEvent, AgentEventBus, EventStream};
use crate::tools::{ToolCall, ToolCallOutcome, ToolRegistry};

/// Message handed to the runtime
#[derive(Debug, Clone)]
pub struct AgentRunRequest {
    pub run_id: String,
    pub session_key: String,
    /// Opaque runtime id of the session (transcript handle)
    pub session_id: Option<String>,
    pub message: String,
}

/// What a finished run produced
#[derive(Debug, Clone, Default)]
pub struct AgentRunOutput {
    pub payloads: Vec<ReplyPayload>,
}

impl AgentRunOutput {
    pub fn text(text: impl Into<String>) -> Self {
        AgentRunOutput {
            payloads: vec![ReplyPayload::text(text)],
        }
    }
}

/// External agent runtime
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run the agent for one message.
    ///
    /// Implementations should watch [`RunHandle::cancellation`] at their own
    /// suspension points; the runner also stops waiting once it fires.
    async fn run(&self, request: AgentRunRequest, handle: RunHandle) -> Result<AgentRunOutput>;
}

/// Per-run handle given to the runtime
#[derive(Clone)]
pub struct RunHandle {
    run_id: String,
    bus: AgentEventBus,
    tools: Arc<ToolRegistry>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub(crate) fn new(run_id: String, bus: AgentEventBus, tools: Arc<ToolRegistry>, cancel: CancellationToken) -> Self {
        RunHandle {
            run_id,
            bus,
            tools,
            cancel,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Publish an event for this run
    pub fn emit(&self, stream: EventStream, data: Value) -> AgentEvent {
        self.bus.emit(&self.run_id, stream, data)
    }

    /// Call a tool through its circuit breaker.
    ///
    /// An open circuit comes back as [`ToolCallOutcome::CircuitOpen`] so the
    /// agent can say the tool is unavailable instead of reporting an error.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolCallOutcome {
        let call = ToolCall::new(name, arguments);
        self.emit(
            EventStream::Tool,
            json!({ "phase": "start", "name": call.name, "toolCallId": call.id }),
        );
        let outcome = self.tools.execute(&call).await;
        self.emit(
            EventStream::Tool,
            json!({
                "phase": "result",
                "name": call.name,
                "toolCallId": call.id,
                "outcome": outcome,
            }),
        );
        outcome
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
