//! Tool trait and shared helpers.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::ToolContext;
pub use crate::error::ToolError;

/// Result of a successful tool action.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// A sandboxed capability addressed as `{tool, action, params}`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Capability name, as used in the role map and in tool calls.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Actions this tool accepts.
    fn actions(&self) -> &'static [&'static str];

    async fn execute(
        &self,
        action: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Build the error for an action outside `actions()`.
    fn unknown_action(&self, action: &str) -> ToolError {
        ToolError::UnknownAction {
            tool: self.name().to_string(),
            action: action.to_string(),
        }
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{key}' parameter")))
}

/// Extract an optional list of strings. A single string is accepted as a one-item list.
pub fn string_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::String(s)) => Ok(vec![s.clone()]),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(String::from).ok_or_else(|| {
                    ToolError::InvalidParameters(format!("'{key}' must contain only strings"))
                })
            })
            .collect(),
        Some(_) => Err(ToolError::InvalidParameters(format!(
            "'{key}' must be a string or a list of strings"
        ))),
    }
}
