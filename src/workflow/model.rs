//! Workflow definition types.
//!
//! Definitions are authored outside the engine and persisted as named,
//! versioned blobs. The engine only relies on the shape below.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// One edge of a workflow state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub from: String,
    pub to: String,
    pub event: String,
    /// Optional `"key:value"` guard matched against the workflow context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl WorkflowTransition {
    pub fn new(from: &str, event: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            event: event.to_string(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }
}

/// States and transitions. Stored as the `definition` blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub states: Vec<String>,
    pub transitions: Vec<WorkflowTransition>,
}

impl WorkflowGraph {
    /// Check that every transition references a declared state.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.states.is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "workflow declares no states".to_string(),
            ));
        }
        let declared: HashSet<&str> = self.states.iter().map(String::as_str).collect();
        for t in &self.transitions {
            for state in [&t.from, &t.to] {
                if !declared.contains(state.as_str()) {
                    return Err(WorkflowError::InvalidDefinition(format!(
                        "transition {} --{}--> {} references undeclared state '{state}'",
                        t.from, t.event, t.to
                    )));
                }
            }
            if t.event.trim().is_empty() {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "transition {} --> {} has an empty event",
                    t.from, t.to
                )));
            }
        }
        Ok(())
    }
}

/// Optional definition metadata.
///
/// `timeouts`, `roles` and `max_loops` are carried for callers; the engine
/// itself only acts on `auto_actions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// State name -> timeout in seconds.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub timeouts: HashMap<String, u64>,
    /// State name -> registered action name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub auto_actions: HashMap<String, String>,
    /// State name -> agent role responsible for it.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub roles: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,
}

/// A persisted workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: i64,
    pub states: Vec<String>,
    pub transitions: Vec<WorkflowTransition>,
    pub metadata: WorkflowMetadata,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// A fresh, active, version-1 definition.
    pub fn new(name: impl Into<String>, graph: WorkflowGraph, metadata: WorkflowMetadata) -> Self {
        Self {
            name: name.into(),
            version: 1,
            states: graph.states,
            transitions: graph.transitions,
            metadata,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    pub fn graph(&self) -> WorkflowGraph {
        WorkflowGraph {
            states: self.states.clone(),
            transitions: self.transitions.clone(),
        }
    }
}

/// Input to `WorkflowEngine::update_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub definition: Option<WorkflowGraph>,
    #[serde(default)]
    pub metadata: Option<WorkflowMetadata>,
}

/// Event fed into a workflow transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkflowEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Result of a successful workflow transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTransitionResult {
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    /// Context after policy overrides were applied.
    pub context: serde_json::Map<String, serde_json::Value>,
}
