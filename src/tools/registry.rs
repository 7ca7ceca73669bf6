//! Tool registry - manages available tools and gates every call through
//! the tool's circuit breaker

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::circuit_breaker::{Admission, CircuitBreakerRegistry, CircuitSnapshot};
use super::traits::{Tool, ToolCall, ToolCallOutcome, ToolResult};
use crate::config::ToolsConfig;
use crate::core::Clock;

/// Registry of available tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    breakers: CircuitBreakerRegistry,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new(config: &ToolsConfig, clock: Arc<dyn Clock>) -> Self {
        ToolRegistry {
            tools: HashMap::new(),
            breakers: CircuitBreakerRegistry::new(
                config.circuit.clone(),
                config.overrides.clone(),
                clock.clone(),
            ),
            clock,
            call_timeout: config.call_timeout,
        }
    }

    /// Register a tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Execute a tool call behind its circuit breaker.
    ///
    /// Errors, failed results and timeouts all count as failures. An open
    /// circuit returns [`ToolCallOutcome::CircuitOpen`] without touching the
    /// tool.
    pub async fn execute(&self, call: &ToolCall) -> ToolCallOutcome {
        let Some(tool) = self.tools.get(&call.name).cloned() else {
            return ToolCallOutcome::Completed(ToolResult::failure(format!("Unknown tool: {}", call.name)));
        };

        if let Admission::Rejected { retry_after_ms } = self.breakers.admit(&call.name) {
            warn!(tool = %call.name, call_id = %call.id, retry_after_ms = ?retry_after_ms, "tool call rejected: circuit open");
            return ToolCallOutcome::CircuitOpen {
                tool: call.name.clone(),
                retry_after_ms,
            };
        }

        let pending = PendingCall {
            breakers: &self.breakers,
            tool: &call.name,
            settled: false,
        };
        let started = self.clock.now_ms();
        let result = match tokio::time::timeout(self.call_timeout, tool.execute(call.arguments.clone())).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ToolResult::failure(e.to_string()),
            Err(_) => ToolResult::failure(format!(
                "Tool '{}' timed out after {}ms",
                call.name,
                self.call_timeout.as_millis()
            )),
        };
        let duration_ms = self.clock.now_ms().saturating_sub(started);

        pending.settle(result.success, duration_ms);
        debug!(tool = %call.name, call_id = %call.id, success = result.success, duration_ms, "tool call finished");
        ToolCallOutcome::Completed(result)
    }

    /// Circuit state of every tool called so far
    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Get tool count
    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// List tool names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

/// Admitted call in progress. Dropped unsettled when the caller is
/// cancelled while the tool runs, which hands the admission back.
struct PendingCall<'a> {
    breakers: &'a CircuitBreakerRegistry,
    tool: &'a str,
    settled: bool,
}

impl PendingCall<'_> {
    fn settle(mut self, success: bool, duration_ms: u64) {
        self.settled = true;
        self.breakers.record(self.tool, success, duration_ms);
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(tool = %self.tool, "tool call cancelled before completion");
            self.breakers.abandon(self.tool);
        }
    }
}
