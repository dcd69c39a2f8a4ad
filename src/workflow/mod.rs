//! Workflow engine for longer-lived business processes.

pub mod builtin;
pub mod engine;
pub mod model;

pub use builtin::{NotifyAction, register_builtin_actions, seed_builtin_workflows};
pub use engine::{AutoAction, WorkflowContext, WorkflowEngine};
pub use model::{
    WorkflowDefinition, WorkflowEvent, WorkflowGraph, WorkflowMetadata, WorkflowTransition,
    WorkflowTransitionResult, WorkflowUpdate,
};
