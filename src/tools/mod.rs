//! Tool abstraction for agent capabilities.

pub mod builtin;
pub mod registry;
pub mod tool;

use std::sync::Arc;

use crate::config::SandboxConfig;
use crate::constraints::ConstraintService;
use crate::queue::TaskQueue;

pub use registry::{ToolRegistry, Toolset, capabilities_for};
pub use tool::*;

/// Registry with every builtin tool wired to the shared constraint service.
pub fn builtin_registry(
    constraints: Arc<ConstraintService>,
    queue: TaskQueue,
    sandbox: &SandboxConfig,
) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register_sync(Arc::new(
        builtin::FilesystemTool::new(Arc::clone(&constraints))
            .with_permissions(sandbox.enforce_permissions),
    ));
    registry.register_sync(Arc::new(
        builtin::ShellTool::new(Arc::clone(&constraints)).with_timeout(sandbox.shell_timeout),
    ));
    registry.register_sync(Arc::new(
        builtin::GitTool::new(constraints).with_timeout(sandbox.shell_timeout),
    ));
    registry.register_sync(Arc::new(builtin::DatabaseTool::new(queue)));
    registry
}
