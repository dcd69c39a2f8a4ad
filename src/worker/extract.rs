//! Tool-call extraction from free-form model output.
//!
//! The grammar is a versioned contract with a non-deterministic producer:
//! the OBSERVE prompt embeds `format_instructions()` and THINK parses the
//! reply with `extract()`. Bump `grammar_version()` when either side changes.

use std::sync::LazyLock;

use regex::Regex;

use crate::worker::context::ToolCall;

/// Extracts `{tool, action, params}` triples from model output.
pub trait ToolCallExtractor: Send + Sync {
    /// Version of the grammar this extractor understands.
    fn grammar_version(&self) -> u32;

    /// Instructions appended to the OBSERVE prompt describing the grammar.
    fn format_instructions(&self) -> String;

    /// Deterministically extract zero or more tool calls, in document order.
    fn extract(&self, text: &str) -> Vec<ToolCall>;
}

static TOOL_CALL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```tool_call[ \t]*\r?\n(.*?)```").expect("tool_call block regex is valid")
});

/// Grammar v1: fenced code blocks tagged `tool_call`, each holding one JSON
/// object or a JSON array of objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct FencedJsonExtractor;

impl FencedJsonExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl ToolCallExtractor for FencedJsonExtractor {
    fn grammar_version(&self) -> u32 {
        1
    }

    fn format_instructions(&self) -> String {
        "To use a tool, emit a fenced code block tagged `tool_call` containing a JSON object \
         (or an array of objects) with the fields \"tool\", \"action\" and \"params\":\n\
         ```tool_call\n{\"tool\": \"filesystem\", \"action\": \"read\", \"params\": {\"path\": \"src/main.rs\"}}\n```\n\
         Emit no tool_call blocks if the task needs no tools."
            .to_string()
    }

    fn extract(&self, text: &str) -> Vec<ToolCall> {
        let mut calls = Vec::new();
        for capture in TOOL_CALL_BLOCK.captures_iter(text) {
            let body = capture.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            match serde_json::from_str::<serde_json::Value>(body) {
                Ok(serde_json::Value::Array(items)) => {
                    calls.extend(items.iter().filter_map(parse_call));
                }
                Ok(value) => calls.extend(parse_call(&value)),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed tool_call block");
                }
            }
        }
        calls
    }
}

fn parse_call(value: &serde_json::Value) -> Option<ToolCall> {
    let tool = value.get("tool")?.as_str()?.trim();
    let action = value.get("action")?.as_str()?.trim();
    if tool.is_empty() || action.is_empty() {
        tracing::debug!(call = %value, "Skipping tool_call without tool/action");
        return None;
    }
    let params = match value.get("params") {
        Some(serde_json::Value::Null) | None => serde_json::json!({}),
        Some(p) => p.clone(),
    };
    Some(ToolCall {
        tool: tool.to_string(),
        action: action.to_string(),
        params,
    })
}
