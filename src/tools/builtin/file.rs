//! Filesystem tool: read, write, list, exists and delete under the sandbox root.
//!
//! Provides controlled access to the filesystem with:
//! - Path validation before any I/O (no traversal, no absolute paths)
//! - Size limits on read/write operations
//! - Optional per-agent path permissions
//! - A distinct "not found" error for missing targets

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use crate::constraints::{ConstraintService, PermissionKind};
use crate::context::ToolContext;
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

const ACTIONS: &[&str] = &["read", "write", "list", "exists", "delete"];

/// Sandboxed filesystem access.
pub struct FilesystemTool {
    constraints: Arc<ConstraintService>,
    enforce_permissions: bool,
}

impl FilesystemTool {
    pub fn new(constraints: Arc<ConstraintService>) -> Self {
        Self {
            constraints,
            enforce_permissions: false,
        }
    }

    /// Consult stored path permissions before every action.
    pub fn with_permissions(mut self, enforce: bool) -> Self {
        self.enforce_permissions = enforce;
        self
    }

    async fn authorize(
        &self,
        ctx: &ToolContext,
        path: &str,
        kind: PermissionKind,
    ) -> Result<(), ToolError> {
        if self.enforce_permissions {
            self.constraints
                .check_permission(&ctx.agent, path, kind)
                .await?;
        }
        Ok(())
    }

    async fn read(&self, path_str: &str, path: &Path) -> Result<serde_json::Value, ToolError> {
        let metadata = fs::metadata(path).await.map_err(|e| io_error(e, path_str))?;
        if metadata.is_dir() {
            return Err(ToolError::InvalidParameters(format!(
                "{path_str} is a directory; use list"
            )));
        }
        if metadata.len() > MAX_READ_SIZE {
            return Err(ToolError::ExecutionFailed(format!(
                "File too large ({} bytes). Maximum is {} bytes.",
                metadata.len(),
                MAX_READ_SIZE
            )));
        }
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| io_error(e, path_str))?;

        Ok(serde_json::json!({
            "path": path_str,
            "content": content,
            "size": metadata.len(),
        }))
    }

    async fn write(
        &self,
        path_str: &str,
        path: &Path,
        content: &str,
    ) -> Result<serde_json::Value, ToolError> {
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "Content too large ({} bytes). Maximum is {} bytes.",
                content.len(),
                MAX_WRITE_SIZE
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!("Failed to create directories: {e}"))
            })?;
        }
        fs::write(path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write file: {e}")))?;

        Ok(serde_json::json!({
            "path": path_str,
            "bytes_written": content.len(),
        }))
    }

    async fn list(&self, path_str: &str, path: &Path) -> Result<serde_json::Value, ToolError> {
        let mut dir = fs::read_dir(path).await.map_err(|e| io_error(e, path_str))?;
        let mut entries = Vec::new();
        let mut truncated = false;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read directory: {e}")))?
        {
            if entries.len() >= MAX_DIR_ENTRIES {
                truncated = true;
                break;
            }
            let metadata = entry.metadata().await.ok();
            entries.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy(),
                "is_dir": metadata.as_ref().is_some_and(|m| m.is_dir()),
                "size": metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(serde_json::json!({
            "path": path_str,
            "entries": entries,
            "truncated": truncated,
        }))
    }

    async fn delete(&self, path_str: &str, path: &Path) -> Result<serde_json::Value, ToolError> {
        let metadata = fs::metadata(path).await.map_err(|e| io_error(e, path_str))?;
        // Directories must be empty; recursive deletes are not offered.
        let result = if metadata.is_dir() {
            fs::remove_dir(path).await
        } else {
            fs::remove_file(path).await
        };
        result.map_err(|e| io_error(e, path_str))?;

        Ok(serde_json::json!({ "path": path_str, "deleted": true }))
    }
}

fn io_error(e: std::io::Error, path: &str) -> ToolError {
    if e.kind() == ErrorKind::NotFound {
        ToolError::NotFound {
            path: path.to_string(),
        }
    } else {
        ToolError::ExecutionFailed(format!("{path}: {e}"))
    }
}

#[async_trait]
impl Tool for FilesystemTool {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn description(&self) -> &str {
        "Read, write, list, check and delete files inside the project workspace. \
         Paths are relative to the workspace root."
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
        let path_str = match action {
            "list" => params.get("path").and_then(|v| v.as_str()).unwrap_or("."),
            _ => require_str(&params, "path")?,
        };
        let path = self.constraints.validate_path_safety(path_str)?;

        let result = match action {
            "read" => {
                self.authorize(ctx, path_str, PermissionKind::Read).await?;
                self.read(path_str, &path).await?
            }
            "write" => {
                let content = require_str(&params, "content")?;
                self.authorize(ctx, path_str, PermissionKind::Write).await?;
                self.write(path_str, &path, content).await?
            }
            "list" => {
                self.authorize(ctx, path_str, PermissionKind::Read).await?;
                self.list(path_str, &path).await?
            }
            "exists" => {
                self.authorize(ctx, path_str, PermissionKind::Read).await?;
                serde_json::json!({
                    "path": path_str,
                    "exists": fs::try_exists(&path).await.unwrap_or(false),
                })
            }
            "delete" => {
                self.authorize(ctx, path_str, PermissionKind::Write).await?;
                self.delete(path_str, &path).await?
            }
            other => return Err(self.unknown_action(other)),
        };

        tracing::debug!(action, path = %path_str, task_id = %ctx.task_id, "Filesystem action done");
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}
