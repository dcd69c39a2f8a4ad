//! Shell execution tool for running whitelisted commands.
//!
//! Provides controlled command execution with:
//! - Blocklist then whitelist validation of every segment
//! - `a && b` chains run in order, stopping at the first failure
//! - `cd` segments move the chain's working directory inside the sandbox
//! - No intermediate shell: each segment is spawned as argv
//! - Timeout enforcement and output truncation

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::constraints::ConstraintService;
use crate::context::ToolContext;
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const ACTIONS: &[&str] = &["run"];

/// Shell command execution tool.
pub struct ShellTool {
    constraints: Arc<ConstraintService>,
    /// Per-segment timeout.
    timeout: Duration,
}

impl ShellTool {
    pub fn new(constraints: Arc<ConstraintService>) -> Self {
        Self {
            constraints,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a `&&` chain. Every segment is validated before any of them runs.
    async fn run_chain(&self, command: &str) -> Result<serde_json::Value, ToolError> {
        let segments: Vec<&str> = command.split("&&").map(str::trim).collect();
        for segment in &segments {
            self.constraints.validate_command(segment)?;
        }

        let root = self.constraints.root().to_path_buf();
        let mut cwd = root.clone();
        let mut steps = Vec::with_capacity(segments.len());

        for segment in segments {
            let argv = split_args(segment)?;
            let Some((program, args)) = argv.split_first() else {
                return Err(ToolError::InvalidParameters("empty command segment".into()));
            };

            if program == "cd" {
                cwd = self.change_dir(&cwd, args)?;
                steps.push(serde_json::json!({ "command": segment, "exit_code": 0, "output": "" }));
                continue;
            }

            let (output, code) = self.execute_direct(program, args, &cwd).await?;
            if code != 0 {
                return Err(ToolError::ExecutionFailed(format!(
                    "'{}' exited with code {code}: {}",
                    truncate_for_error(segment),
                    truncate_for_error(output.trim())
                )));
            }
            steps.push(serde_json::json!({ "command": segment, "exit_code": code, "output": output }));
        }

        let relative_cwd = cwd
            .strip_prefix(&root)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let output = steps
            .iter()
            .filter_map(|s| s["output"].as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(serde_json::json!({
            "output": truncate_output(&output),
            "steps": steps,
            "cwd": if relative_cwd.is_empty() { ".".to_string() } else { relative_cwd },
            "success": true,
        }))
    }

    /// Resolve a `cd` target relative to the chain's current directory.
    fn change_dir(&self, cwd: &Path, args: &[String]) -> Result<PathBuf, ToolError> {
        let target = match args {
            [] => return Ok(self.constraints.root().to_path_buf()),
            [dir] => dir,
            _ => {
                return Err(ToolError::InvalidParameters(
                    "cd takes exactly one argument".into(),
                ));
            }
        };
        if Path::new(target).is_absolute() {
            return Err(crate::error::ConstraintError::validation(format!(
                "absolute path not allowed: {target}"
            ))
            .into());
        }
        let next = cwd.join(target);
        self.constraints.validate_working_dir(&next)?;
        if !next.is_dir() {
            return Err(ToolError::NotFound {
                path: target.clone(),
            });
        }
        Ok(next)
    }

    /// Spawn `program args...` directly, capturing stdout and stderr.
    async fn execute_direct(
        &self,
        program: &str,
        args: &[String],
        workdir: &Path,
    ) -> Result<(String, i32), ToolError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to spawn {program}: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed(format!(
                    "Command execution failed: {e}"
                )));
            }
            // Dropping the future drops the child, which kills it.
            Err(_) => return Err(ToolError::Timeout(self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        Ok((truncate_output(&combined), output.status.code().unwrap_or(-1)))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run whitelisted commands (npm, cargo, ls, ...) in the workspace. \
         Chain with &&; cd changes directory for the rest of the chain. \
         Use the git tool for git."
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
        if action != "run" {
            return Err(self.unknown_action(action));
        }
        let command = require_str(&params, "command")?;

        let start = std::time::Instant::now();
        tracing::debug!(task_id = %ctx.task_id, command = %truncate_for_error(command), "Running shell command");
        let result = self.run_chain(command).await?;
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

/// Split a segment into argv, honouring single and double quotes.
fn split_args(segment: &str) -> Result<Vec<String>, ToolError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in segment.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(ToolError::InvalidParameters(format!(
            "unterminated quote in: {}",
            truncate_for_error(segment)
        )));
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConstraintError;
    use crate::store::LibSqlBackend;
    use tempfile::TempDir;

    async fn tool(dir: &TempDir) -> ShellTool {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        ShellTool::new(Arc::new(ConstraintService::new(dir.path(), store)))
    }

    async fn run(tool: &ShellTool, command: &str) -> Result<ToolOutput, ToolError> {
        tool.execute(
            "run",
            serde_json::json!({ "command": command }),
            &ToolContext::default(),
        )
        .await
    }

    #[test]
    fn split_args_honours_quotes() {
        assert_eq!(
            split_args(r#"git commit -m "fix the bug""#).unwrap(),
            vec!["git", "commit", "-m", "fix the bug"]
        );
        assert_eq!(split_args("echo ''").unwrap(), vec!["echo", ""]);
        assert!(split_args("echo \"open").is_err());
    }

    #[test]
    fn truncate_keeps_head_and_tail() {
        let long = "x".repeat(MAX_OUTPUT_SIZE + 10);
        let out = truncate_output(&long);
        assert!(out.contains("[truncated 10 bytes]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_command() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir).await;
        let out = run(&tool, "echo hello").await.unwrap();
        assert!(out.result["output"].as_str().unwrap().contains("hello"));
        assert_eq!(out.result["success"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chain_with_cd_moves_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/marker.txt"), "").unwrap();
        let tool = tool(&dir).await;

        let out = run(&tool, "cd pkg && ls").await.unwrap();
        assert!(out.result["output"].as_str().unwrap().contains("marker.txt"));
        assert_eq!(out.result["cwd"], "pkg");
        assert_eq!(out.result["steps"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_segment_stops_whole_chain_before_it_runs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
        let tool = tool(&dir).await;

        let err = run(&tool, "touch made.txt && find . -delete")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Constraint(ConstraintError::Validation { .. })));
        assert!(!dir.path().join("made.txt").exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn blocked_and_unlisted_commands_never_run() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir).await;

        for command in [
            "sudo ls",
            "rm -rf /",
            "cat ../../etc/passwd",
            "echo `id`",
            "curl http://x",
            "ls && sudo ls",
            "cat /etc/passwd",
            "find . -delete",
            "find . -exec curl http://x +",
            "git push --force origin main",
            "cat ~/.ssh/id_rsa",
        ] {
            let err = run(&tool, command).await.unwrap_err();
            assert!(
                matches!(err, ToolError::Constraint(ConstraintError::Validation { .. })),
                "{command} should be rejected, got {err}"
            );
        }
    }

    #[tokio::test]
    async fn cd_into_missing_dir_is_not_found() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir).await;
        let err = run(&tool, "cd nowhere && ls").await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_segment_stops_chain() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir).await;
        let err = run(&tool, "ls missing-dir && touch created.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert!(!dir.path().join("created.txt").exists());
    }

    #[tokio::test]
    async fn only_run_action_exists() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir).await;
        let err = tool
            .execute("exec", serde_json::json!({"command": "ls"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownAction { .. }));
    }
}
