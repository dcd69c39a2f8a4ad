//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::constraints::{Lock, Permission, PermissionKind};
use crate::error::DatabaseError;
use crate::queue::model::{Task, TaskStatus};
use crate::worker::state::TransitionLogEntry;
use crate::workflow::model::{WorkflowDefinition, WorkflowGraph, WorkflowMetadata};

/// Ordering for transition-log queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Backend-agnostic database trait covering tasks, transitions, workflows,
/// locks and permissions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task row.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Atomically claim the oldest pending task for `worker_id`.
    ///
    /// Concurrent callers never wait on each other: a row already claimed by
    /// someone else is skipped and the caller gets the next one or `None`.
    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Move a `running` task to `completed`. Returns `false` if it wasn't running.
    async fn complete_task(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a `running` task to `failed`. Returns `false` if it wasn't running.
    async fn fail_task(&self, id: Uuid, error: &str, now: DateTime<Utc>)
    -> Result<bool, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<i64, DatabaseError>;

    /// Tasks with `status`, oldest first.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    // ── Transition log ──────────────────────────────────────────────

    async fn insert_transition(&self, entry: &TransitionLogEntry) -> Result<(), DatabaseError>;

    async fn list_transitions(
        &self,
        subtask_id: &str,
        order: SortOrder,
    ) -> Result<Vec<TransitionLogEntry>, DatabaseError>;

    async fn latest_transition(
        &self,
        subtask_id: &str,
    ) -> Result<Option<TransitionLogEntry>, DatabaseError>;

    // ── Workflows ───────────────────────────────────────────────────

    /// Fetch an active workflow by name.
    async fn get_active_workflow(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, DatabaseError>;

    /// All active workflows, ordered by name.
    async fn list_active_workflows(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError>;

    /// Insert a workflow unless one with the same name exists. Returns whether it was inserted.
    async fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<bool, DatabaseError>;

    /// Replace name and definition of the workflow currently named `name`,
    /// bumping its version. `None` metadata keeps the stored metadata, active
    /// or not. Returns the stored row, or `None` if absent.
    async fn update_workflow(
        &self,
        name: &str,
        new_name: &str,
        graph: &WorkflowGraph,
        metadata: Option<&WorkflowMetadata>,
    ) -> Result<Option<WorkflowDefinition>, DatabaseError>;

    // ── Concern locks ───────────────────────────────────────────────

    /// Take `(task_id, concern)` for `agent_id` if free.
    ///
    /// Returns the lock as it stands afterwards, which may belong to another agent.
    async fn acquire_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Lock, DatabaseError>;

    /// Delete the lock if held by `agent_id`. Returns whether a row was removed.
    async fn release_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
    ) -> Result<bool, DatabaseError>;

    async fn get_lock(&self, task_id: &str, concern: &str) -> Result<Option<Lock>, DatabaseError>;

    // ── Permissions ─────────────────────────────────────────────────

    async fn insert_permission(&self, permission: &Permission) -> Result<(), DatabaseError>;

    /// Permissions of `agent_id` for `kind`, highest priority first.
    async fn list_permissions(
        &self,
        agent_id: &str,
        kind: PermissionKind,
    ) -> Result<Vec<Permission>, DatabaseError>;
}
