//! Tool invocation context.

use serde::Serialize;
use uuid::Uuid;

/// Identity of the run a tool action belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    pub task_id: Uuid,
    /// Key for transition logs and concern locks.
    pub subtask_id: String,
    /// Agent role the task runs as. Used for rate limits and permissions.
    pub agent: String,
}

impl ToolContext {
    pub fn new(task_id: Uuid, subtask_id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            task_id,
            subtask_id: subtask_id.into(),
            agent: agent.into(),
        }
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        let task_id = Uuid::new_v4();
        Self {
            task_id,
            subtask_id: task_id.to_string(),
            agent: "default".to_string(),
        }
    }
}
