//! Core tool trait and result types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A tool the agent runtime can call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name
    fn name(&self) -> &str;

    /// Get the tool description
    fn description(&self) -> &str;

    /// Get the JSON Schema for tool parameters
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with given arguments
    async fn execute(&self, args: Value) -> Result<ToolResult>;
}

/// Result of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the execution was successful
    pub success: bool,
    /// Result content (for successful execution)
    pub content: Option<String>,
    /// Error message (for failed execution)
    pub error: Option<String>,
    /// Additional metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(content: impl Into<String>) -> Self {
        ToolResult {
            success: true,
            content: Some(content.into()),
            error: None,
            metadata: None,
        }
    }

    /// Create a successful result with metadata
    pub fn success_with_metadata(content: impl Into<String>, metadata: Value) -> Self {
        ToolResult {
            success: true,
            content: Some(content.into()),
            error: None,
            metadata: Some(metadata),
        }
    }

    /// Create a failed result
    pub fn failure(error: impl Into<String>) -> Self {
        ToolResult {
            success: false,
            content: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    /// Render for the agent transcript
    pub fn render(&self) -> String {
        if self.success {
            self.content.clone().unwrap_or_default()
        } else {
            format!("Error: {}", self.error.clone().unwrap_or_default())
        }
    }
}

/// A tool call requested by the agent runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool call ID
    pub id: String,
    /// Tool name
    pub name: String,
    /// Tool arguments as JSON
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }

    /// Parse arguments into a specific type
    pub fn parse_arguments<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.arguments.clone())
            .map_err(|e| Error::Validation(format!("Invalid tool arguments: {}", e)))
    }
}

/// What the runtime gets back from a gated tool call.
///
/// `CircuitOpen` is deliberately not a failed [`ToolResult`]: the tool was
/// never attempted, and the agent should say it is unavailable rather than
/// report an error from it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ToolCallOutcome {
    Completed(ToolResult),
    #[serde(rename_all = "camelCase")]
    CircuitOpen {
        tool: String,
        retry_after_ms: Option<u64>,
    },
}

impl ToolCallOutcome {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ToolCallOutcome::CircuitOpen { .. })
    }

    /// Convert into a `Result`, mapping an open circuit to
    /// [`Error::CircuitOpen`]
    pub fn into_result(self) -> Result<ToolResult> {
        match self {
            ToolCallOutcome::Completed(result) => Ok(result),
            ToolCallOutcome::CircuitOpen { tool, retry_after_ms } => Err(Error::CircuitOpen { tool, retry_after_ms }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result() {
        let success = ToolResult::success("Done!");
        assert!(success.success);
        assert_eq!(success.render(), "Done!");

        let failure = ToolResult::failure("Oops!");
        assert!(!failure.success);
        assert_eq!(failure.render(), "Error: Oops!");
    }

    #[test]
    fn test_parse_arguments() {
        #[derive(Deserialize)]
        struct Args {
            query: String,
        }
        let call = ToolCall::new("search", serde_json::json!({ "query": "rust" }));
        let args: Args = call.parse_arguments().unwrap();
        assert_eq!(args.query, "rust");

        let bad = ToolCall::new("search", serde_json::json!({ "q": 1 }));
        assert!(matches!(bad.parse_arguments::<Args>(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_circuit_open_is_distinguishable() {
        let outcome = ToolCallOutcome::CircuitOpen {
            tool: "search".into(),
            retry_after_ms: Some(500),
        };
        assert!(outcome.is_circuit_open());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "circuitOpen");
        assert!(matches!(outcome.into_result(), Err(Error::CircuitOpen { .. })));
    }
}
