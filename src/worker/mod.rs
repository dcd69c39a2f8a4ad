//! Worker system: the per-task agent loop.
//!
//! Core components:
//! - `state`: Agent FSM (OBSERVE → THINK → ACT → WAIT → VERIFY → COMPLETE/ERROR)
//! - `context`: Execution context threaded through one run
//! - `extract`: Tool-call extraction from model output
//! - `hooks`: WAIT/VERIFY extension points
//! - `executor`: Drives claimed tasks and spawns polling workers

pub mod context;
pub mod executor;
pub mod extract;
pub mod hooks;
pub mod state;

pub use context::{ExecutionContext, Plan, ToolCall};
pub use executor::{Executor, ExecutorDeps, RunOutcome, spawn_worker};
pub use extract::{FencedJsonExtractor, ToolCallExtractor};
pub use hooks::{PassThroughHooks, StageHooks};
pub use state::{
    AgentEvent, AgentState, EventKind, TransitionLogEntry, create_log_entry, transition,
    update_context,
};
