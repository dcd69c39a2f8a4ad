//! Per-run execution context.

use serde::{Deserialize, Serialize};

use crate::worker::state::EventKind;

/// A single tool invocation addressed by `{tool, action, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ToolCall {
    /// `tool.action`, used in logs and error messages.
    pub fn label(&self) -> String {
        format!("{}.{}", self.tool, self.action)
    }
}

/// The outcome of a THINK step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Plan {
    /// An empty plan. Valid: the model asked for no tools.
    pub fn no_tools() -> Self {
        Self {
            content: "No tools needed".to_string(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_calls(tool_calls: Vec<ToolCall>) -> Self {
        if tool_calls.is_empty() {
            return Self::no_tools();
        }
        let labels = tool_calls
            .iter()
            .map(ToolCall::label)
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            content: format!("{} tool call(s): {}", tool_calls.len(), labels),
            tool_calls,
        }
    }
}

/// Mutable bag threaded through one executor run.
///
/// Owned by exactly one in-flight run; never shared between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub step_count: u32,
    pub last_event: Option<EventKind>,
    pub last_observation: Option<String>,
    pub plan: Option<Plan>,
    pub action_result: Option<Vec<serde_json::Value>>,
    pub tool_calls: Vec<ToolCall>,
    pub retry_count: u32,
    pub error: Option<String>,
}
