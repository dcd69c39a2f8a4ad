//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::constraints::{Lock, Permission, PermissionKind};
use crate::error::DatabaseError;
use crate::queue::model::{Task, TaskStatus};
use crate::store::migrations;
use crate::store::traits::{Database, SortOrder};
use crate::worker::state::TransitionLogEntry;
use crate::workflow::model::{WorkflowDefinition, WorkflowGraph, WorkflowMetadata};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width so text ordering matches time ordering.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &impl serde::Serialize, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

const TASK_COLUMNS: &str =
    "id, task_type, payload, status, worker_id, result, error, created_at, started_at, completed_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("task.id parse: {e}")))?;
    let task_type: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.task_type: {e}")))?;

    let payload_str: String = row.get(2).unwrap_or_else(|_| "{}".to_string());
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.payload: {e}")))?;

    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status: TaskStatus = status_str.parse().map_err(DatabaseError::Query)?;

    let result = row
        .get::<String>(5)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());
    let created_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Query(format!("task.created_at: {e}")))?;

    Ok(Task {
        id,
        task_type,
        payload,
        status,
        worker_id: row.get::<String>(4).ok(),
        result,
        error: row.get::<String>(6).ok(),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(row.get::<String>(8).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(9).ok()),
    })
}

const TRANSITION_COLUMNS: &str = "subtask_id, agent, from_state, to_state, timestamp";

fn row_to_transition(row: &libsql::Row) -> Result<TransitionLogEntry, DatabaseError> {
    let get = |idx: i32, field: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("transition.{field}: {e}")))
    };
    Ok(TransitionLogEntry {
        subtask_id: get(0, "subtask_id")?,
        agent: get(1, "agent")?,
        from_state: get(2, "from_state")?,
        to_state: get(3, "to_state")?,
        timestamp: parse_datetime(&get(4, "timestamp")?),
    })
}

const WORKFLOW_COLUMNS: &str = "name, version, definition, metadata, is_active, updated_at";

fn row_to_workflow(row: &libsql::Row) -> Result<WorkflowDefinition, DatabaseError> {
    let name: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("workflow.name: {e}")))?;
    let definition_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("workflow.definition: {e}")))?;
    let graph: WorkflowGraph = serde_json::from_str(&definition_str)
        .map_err(|e| DatabaseError::Serialization(format!("workflow '{name}' definition: {e}")))?;
    let metadata: WorkflowMetadata = row
        .get::<String>(3)
        .ok()
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("workflow '{name}' metadata: {e}")))?
        .unwrap_or_default();
    let updated_str: String = row.get(5).unwrap_or_default();

    Ok(WorkflowDefinition {
        version: row.get::<i64>(1).unwrap_or(1),
        states: graph.states,
        transitions: graph.transitions,
        metadata,
        is_active: row.get::<i64>(4).unwrap_or(0) != 0,
        updated_at: parse_datetime(&updated_str),
        name,
    })
}

fn row_to_lock(row: &libsql::Row) -> Result<Lock, DatabaseError> {
    let get = |idx: i32, field: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("lock.{field}: {e}")))
    };
    Ok(Lock {
        task_id: get(0, "task_id")?,
        concern: get(1, "concern")?,
        agent_id: get(2, "agent_id")?,
        locked_at: parse_datetime(&get(3, "locked_at")?),
    })
}

fn row_to_permission(row: &libsql::Row) -> Result<Permission, DatabaseError> {
    let kind_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("permission.permission: {e}")))?;
    Ok(Permission {
        agent_id: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("permission.agent_id: {e}")))?,
        path_pattern: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("permission.path_pattern: {e}")))?,
        permission: kind_str.parse().map_err(DatabaseError::Query)?,
        allowed: row.get::<i64>(3).unwrap_or(0) != 0,
        priority: row.get::<i64>(4).unwrap_or(0),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    task.id.to_string(),
                    task.task_type.clone(),
                    to_json(&task.payload, "task.payload")?,
                    task.status.as_str(),
                    opt_text(task.worker_id.clone()),
                    opt_text(
                        task.result
                            .as_ref()
                            .map(|r| to_json(r, "task.result"))
                            .transpose()?
                    ),
                    opt_text(task.error.clone()),
                    fmt_datetime(&task.created_at),
                    opt_text(task.started_at.as_ref().map(fmt_datetime)),
                    opt_text(task.completed_at.as_ref().map(fmt_datetime)),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, task_type = %task.task_type, "Task inserted into DB");
        Ok(())
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        // Single statement: the sub-select picks the oldest pending row and the
        // outer guard re-checks `pending`, so a row taken by someone else in
        // between matches nothing instead of being claimed twice.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET status = 'running', worker_id = ?1, started_at = ?2
                     WHERE id = (
                         SELECT id FROM tasks WHERE status = 'pending'
                         ORDER BY created_at, rowid LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {TASK_COLUMNS}"
                ),
                params![worker_id, fmt_datetime(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_next_task: {e}"))),
        }
    }

    async fn complete_task(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', result = ?1, completed_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![
                    to_json(result, "task.result")?,
                    fmt_datetime(&now),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;
        Ok(affected > 0)
    }

    async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', error = ?1, completed_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![error, fmt_datetime(&now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;
        Ok(affected > 0)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks_by_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("count_tasks_by_status: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_tasks_by_status: {e}"))),
        }
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at, rowid"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    // ── Transition log ──────────────────────────────────────────────

    async fn insert_transition(&self, entry: &TransitionLogEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO transition_log ({TRANSITION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    entry.subtask_id.clone(),
                    entry.agent.clone(),
                    entry.from_state.clone(),
                    entry.to_state.clone(),
                    fmt_datetime(&entry.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_transition: {e}")))?;
        Ok(())
    }

    async fn list_transitions(
        &self,
        subtask_id: &str,
        order: SortOrder,
    ) -> Result<Vec<TransitionLogEntry>, DatabaseError> {
        let dir = order.as_sql();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSITION_COLUMNS} FROM transition_log WHERE subtask_id = ?1
                     ORDER BY timestamp {dir}, id {dir}"
                ),
                params![subtask_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_transitions: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_transitions: {e}")))?
        {
            entries.push(row_to_transition(&row)?);
        }
        Ok(entries)
    }

    async fn latest_transition(
        &self,
        subtask_id: &str,
    ) -> Result<Option<TransitionLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSITION_COLUMNS} FROM transition_log WHERE subtask_id = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT 1"
                ),
                params![subtask_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_transition: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_transition(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_transition: {e}"))),
        }
    }

    // ── Workflows ───────────────────────────────────────────────────

    async fn get_active_workflow(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE name = ?1 AND is_active = 1"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_workflow: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_workflow(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_workflow: {e}"))),
        }
    }

    async fn list_active_workflows(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE is_active = 1 ORDER BY name"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_workflows: {e}")))?;

        let mut workflows = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_workflows: {e}")))?
        {
            workflows.push(row_to_workflow(&row)?);
        }
        Ok(workflows)
    }

    async fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<bool, DatabaseError> {
        let now = fmt_datetime(&workflow.updated_at);
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO workflows
                     (name, version, definition, metadata, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    workflow.name.clone(),
                    workflow.version,
                    to_json(&workflow.graph(), "workflow.definition")?,
                    to_json(&workflow.metadata, "workflow.metadata")?,
                    workflow.is_active as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_workflow: {e}")))?;
        Ok(affected > 0)
    }

    async fn update_workflow(
        &self,
        name: &str,
        new_name: &str,
        graph: &WorkflowGraph,
        metadata: Option<&WorkflowMetadata>,
    ) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        let metadata = metadata
            .map(|m| to_json(m, "workflow.metadata"))
            .transpose()?;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE workflows
                     SET name = ?1, definition = ?2, metadata = COALESCE(?3, metadata),
                         version = version + 1, updated_at = ?4
                     WHERE name = ?5
                     RETURNING {WORKFLOW_COLUMNS}"
                ),
                params![
                    new_name,
                    to_json(graph, "workflow.definition")?,
                    opt_text(metadata),
                    fmt_datetime(&Utc::now()),
                    name,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_workflow: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_workflow(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("update_workflow: {e}"))),
        }
    }

    // ── Concern locks ───────────────────────────────────────────────

    async fn acquire_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Lock, DatabaseError> {
        // The no-op upsert returns the existing row on conflict, so the caller
        // always learns the current holder from one atomic statement.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO locks (task_id, concern, agent_id, locked_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id, concern) DO UPDATE SET agent_id = locks.agent_id
                 RETURNING task_id, concern, agent_id, locked_at",
                params![task_id, concern, agent_id, fmt_datetime(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("acquire_lock: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_lock(&row),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "lock".to_string(),
                id: format!("{task_id}/{concern}"),
            }),
            Err(e) => Err(DatabaseError::Query(format!("acquire_lock: {e}"))),
        }
    }

    async fn release_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM locks WHERE task_id = ?1 AND concern = ?2 AND agent_id = ?3",
                params![task_id, concern, agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lock: {e}")))?;
        Ok(affected > 0)
    }

    async fn get_lock(&self, task_id: &str, concern: &str) -> Result<Option<Lock>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT task_id, concern, agent_id, locked_at FROM locks
                 WHERE task_id = ?1 AND concern = ?2",
                params![task_id, concern],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lock: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lock(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lock: {e}"))),
        }
    }

    // ── Permissions ─────────────────────────────────────────────────

    async fn insert_permission(&self, permission: &Permission) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO permissions (agent_id, path_pattern, permission, allowed, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    permission.agent_id.clone(),
                    permission.path_pattern.clone(),
                    permission.permission.as_str(),
                    permission.allowed as i64,
                    permission.priority,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_permission: {e}")))?;
        Ok(())
    }

    async fn list_permissions(
        &self,
        agent_id: &str,
        kind: PermissionKind,
    ) -> Result<Vec<Permission>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT agent_id, path_pattern, permission, allowed, priority FROM permissions
                 WHERE agent_id = ?1 AND permission = ?2
                 ORDER BY priority DESC, id ASC",
                params![agent_id, kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_permissions: {e}")))?;

        let mut permissions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_permissions: {e}")))?
        {
            permissions.push(row_to_permission(&row)?);
        }
        Ok(permissions)
    }
}
