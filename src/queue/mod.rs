//! Task queue: durable, concurrency-safe work distribution.
//!
//! The claim in `dequeue` is the only cross-worker coordination point.
//! `complete` and `fail` touch only `running` rows, so duplicate calls are
//! harmless and return `false`.

pub mod model;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

pub use model::{Task, TaskStatus};

/// Queue facade over the shared store.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn Database>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Add a new pending task.
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
    ) -> Result<Task, DatabaseError> {
        let task = Task::new(task_type, payload);
        self.store.insert_task(&task).await?;
        info!(task_id = %task.id, task_type = %task.task_type, "Task enqueued");
        Ok(task)
    }

    /// Claim the oldest pending task for `worker_id`, or `None` if there is
    /// nothing left to claim.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Task>, DatabaseError> {
        let claimed = self.store.claim_next_task(worker_id, Utc::now()).await?;
        if let Some(task) = &claimed {
            info!(task_id = %task.id, worker = %worker_id, task_type = %task.task_type, "Task claimed");
        }
        Ok(claimed)
    }

    /// Mark a running task as completed.
    pub async fn complete(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let updated = self.store.complete_task(task_id, &result, Utc::now()).await?;
        if updated {
            info!(task_id = %task_id, "Task completed");
        } else {
            debug!(task_id = %task_id, "complete() ignored: task not running");
        }
        Ok(updated)
    }

    /// Mark a running task as failed with a human-readable error.
    pub async fn fail(&self, task_id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let updated = self.store.fail_task(task_id, error, Utc::now()).await?;
        if updated {
            warn!(task_id = %task_id, error = %error, "Task failed");
        } else {
            debug!(task_id = %task_id, "fail() ignored: task not running");
        }
        Ok(updated)
    }

    pub async fn get_pending_count(&self) -> Result<i64, DatabaseError> {
        self.store.count_tasks_by_status(TaskStatus::Pending).await
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.store.list_tasks_by_status(status).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.store.get_task(task_id).await
    }
}
