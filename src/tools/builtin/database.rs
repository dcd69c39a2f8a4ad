//! Task-queue access for orchestrating agents.

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::queue::{TaskQueue, TaskStatus};
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

const ACTIONS: &[&str] = &["enqueue", "pending_count", "tasks_by_status"];

/// Lets an orchestrator fan work out to other agents through the queue.
pub struct DatabaseTool {
    queue: TaskQueue,
}

impl DatabaseTool {
    pub fn new(queue: TaskQueue) -> Self {
        Self { queue }
    }
}

fn store_error(e: crate::error::DatabaseError) -> ToolError {
    ToolError::ExecutionFailed(e.to_string())
}

#[async_trait]
impl Tool for DatabaseTool {
    fn name(&self) -> &str {
        "database"
    }

    fn description(&self) -> &str {
        "Enqueue tasks for other agents and inspect the task queue."
    }

    fn actions(&self) -> &'static [&'static str] {
        ACTIONS
    }

    async fn execute(
        &self,
        action: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let result = match action {
            "enqueue" => {
                let task_type = require_str(&params, "type")?;
                let mut payload = params
                    .get("payload")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                if !payload.is_object() {
                    return Err(ToolError::InvalidParameters(
                        "'payload' must be an object".into(),
                    ));
                }
                if let Some(obj) = payload.as_object_mut() {
                    obj.entry("parentTaskId")
                        .or_insert_with(|| serde_json::json!(ctx.task_id.to_string()));
                }
                let task = self
                    .queue
                    .enqueue(task_type, payload)
                    .await
                    .map_err(store_error)?;
                serde_json::json!({ "taskId": task.id, "status": task.status })
            }
            "pending_count" => {
                let count = self.queue.get_pending_count().await.map_err(store_error)?;
                serde_json::json!({ "pending": count })
            }
            "tasks_by_status" => {
                let status: TaskStatus = require_str(&params, "status")?
                    .parse()
                    .map_err(ToolError::InvalidParameters)?;
                let tasks = self
                    .queue
                    .get_tasks_by_status(status)
                    .await
                    .map_err(store_error)?;
                serde_json::to_value(&tasks)
                    .map_err(|e| ToolError::ExecutionFailed(format!("serialize tasks: {e}")))?
            }
            other => return Err(self.unknown_action(other)),
        };
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::LibSqlBackend;

    async fn tool() -> (DatabaseTool, TaskQueue) {
        let queue = TaskQueue::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()));
        (DatabaseTool::new(queue.clone()), queue)
    }

    #[tokio::test]
    async fn enqueue_records_parent_and_counts() {
        let (tool, queue) = tool().await;
        let ctx = ToolContext::default();

        tool.execute(
            "enqueue",
            serde_json::json!({"type": "tester", "payload": {"subtaskId": "T2"}}),
            &ctx,
        )
        .await
        .unwrap();

        let count = tool
            .execute("pending_count", serde_json::json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(count.result["pending"], 1);

        let pending = queue.get_tasks_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending[0].payload["parentTaskId"], ctx.task_id.to_string());
    }

    #[tokio::test]
    async fn tasks_by_status_validates_status() {
        let (tool, _) = tool().await;
        let ctx = ToolContext::default();
        let err = tool
            .execute("tasks_by_status", serde_json::json!({"status": "stuck"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let out = tool
            .execute("tasks_by_status", serde_json::json!({"status": "failed"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result, serde_json::json!([]));
    }
}
