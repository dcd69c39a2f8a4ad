//! Delegating `Database` double for exercising failure and interleaving paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::constraints::{Lock, Permission, PermissionKind};
use crate::error::DatabaseError;
use crate::queue::model::{Task, TaskStatus};
use crate::store::{Database, LibSqlBackend, SortOrder};
use crate::worker::state::TransitionLogEntry;
use crate::workflow::model::{WorkflowDefinition, WorkflowGraph, WorkflowMetadata};

/// Forwards to an in-memory libSQL backend, with switchable faults.
pub(crate) struct FlakyStore {
    inner: Arc<dyn Database>,
    fail_transitions: AtomicBool,
    hold_next_workflow_read: AtomicBool,
    /// Signalled once a held workflow read has fetched its row.
    pub(crate) read_fetched: Notify,
    /// Lets a held workflow read return.
    pub(crate) release_read: Notify,
}

impl FlakyStore {
    pub(crate) async fn new() -> Arc<Self> {
        let inner: Arc<dyn Database> = Arc::new(
            LibSqlBackend::new_memory()
                .await
                .expect("in-memory database"),
        );
        Arc::new(Self {
            inner,
            fail_transitions: AtomicBool::new(false),
            hold_next_workflow_read: AtomicBool::new(false),
            read_fetched: Notify::new(),
            release_read: Notify::new(),
        })
    }

    pub(crate) fn fail_transitions(&self, fail: bool) {
        self.fail_transitions.store(fail, Ordering::SeqCst);
    }

    /// Make the next `get_active_workflow` pause after reading its row until
    /// `release_read` is notified.
    pub(crate) fn hold_next_workflow_read(&self) {
        self.hold_next_workflow_read.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for FlakyStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.inner.insert_task(task).await
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        self.inner.claim_next_task(worker_id, now).await
    }

    async fn complete_task(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner.complete_task(id, result, now).await
    }

    async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner.fail_task(id, error, now).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<i64, DatabaseError> {
        self.inner.count_tasks_by_status(status).await
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_tasks_by_status(status).await
    }

    async fn insert_transition(&self, entry: &TransitionLogEntry) -> Result<(), DatabaseError> {
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("transition_log: disk I/O error".into()));
        }
        self.inner.insert_transition(entry).await
    }

    async fn list_transitions(
        &self,
        subtask_id: &str,
        order: SortOrder,
    ) -> Result<Vec<TransitionLogEntry>, DatabaseError> {
        self.inner.list_transitions(subtask_id, order).await
    }

    async fn latest_transition(
        &self,
        subtask_id: &str,
    ) -> Result<Option<TransitionLogEntry>, DatabaseError> {
        self.inner.latest_transition(subtask_id).await
    }

    async fn get_active_workflow(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        let row = self.inner.get_active_workflow(name).await;
        if self.hold_next_workflow_read.swap(false, Ordering::SeqCst) {
            self.read_fetched.notify_one();
            self.release_read.notified().await;
        }
        row
    }

    async fn list_active_workflows(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        self.inner.list_active_workflows().await
    }

    async fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<bool, DatabaseError> {
        self.inner.insert_workflow(workflow).await
    }

    async fn update_workflow(
        &self,
        name: &str,
        new_name: &str,
        graph: &WorkflowGraph,
        metadata: Option<&WorkflowMetadata>,
    ) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        self.inner.update_workflow(name, new_name, graph, metadata).await
    }

    async fn acquire_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Lock, DatabaseError> {
        self.inner.acquire_lock(task_id, concern, agent_id, now).await
    }

    async fn release_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.inner.release_lock(task_id, concern, agent_id).await
    }

    async fn get_lock(&self, task_id: &str, concern: &str) -> Result<Option<Lock>, DatabaseError> {
        self.inner.get_lock(task_id, concern).await
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<(), DatabaseError> {
        self.inner.insert_permission(permission).await
    }

    async fn list_permissions(
        &self,
        agent_id: &str,
        kind: PermissionKind,
    ) -> Result<Vec<Permission>, DatabaseError> {
        self.inner.list_permissions(agent_id, kind).await
    }
}
