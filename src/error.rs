//! Error types for the agent execution core.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Constraint error: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Reasoning backend (adapter) errors. Fatal for the current OBSERVE step.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Typed rejections raised by the constraint service.
///
/// Validation and permission failures are fatal; lock and rate-limit
/// failures may be retried by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ConstraintError {
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Resource locked: {resource} (held by {holder})")]
    ResourceLocked { resource: String, holder: String },

    #[error("Rate limit exceeded for agent {agent_id}, retry after {retry_after:?}")]
    RateLimited {
        agent_id: String,
        retry_after: Duration,
    },

    #[error("Permission denied: agent {agent_id} may not {permission} {path}")]
    PermissionDenied {
        agent_id: String,
        path: String,
        permission: String,
    },

    #[error("Constraint store error: {0}")]
    Store(#[from] DatabaseError),
}

impl ConstraintError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry (possibly after backing off).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceLocked { .. } | Self::RateLimited { .. })
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Tool {tool} has no action '{action}'")]
    UnknownAction { tool: String, action: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised while driving a task through the agent loop.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Step budget exceeded (max {max_steps} steps)")]
    StepBudgetExceeded { max_steps: u32 },

    #[error("No tools available for role '{role}'")]
    NoTools { role: String },

    #[error("Unknown tool '{tool}' for role '{role}'")]
    UnknownTool { tool: String, role: String },

    #[error("No valid transition from {state} on {event}")]
    Transition { state: String, event: String },

    #[error("Task {id} panicked: {reason}")]
    Panicked { id: Uuid, reason: String },
}

/// Workflow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow '{name}' not found or inactive")]
    NotFound { name: String },

    #[error("No valid transition for workflow '{workflow}' from '{state}' on '{event}'")]
    NoValidTransition {
        workflow: String,
        state: String,
        event: String,
    },

    #[error("Workflow execution is paused ({scope})")]
    Paused { scope: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Auto action '{action}' failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Telemetry publish errors. Always swallowed by callers.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("No telemetry subscribers")]
    NoSubscribers,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
