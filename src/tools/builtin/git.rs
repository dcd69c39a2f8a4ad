//! Git tool with a fixed subcommand whitelist.
//!
//! Every string argument is scanned before it reaches `git`. Mutating
//! subcommands check the repository lock marker first, and `push` is rate
//! limited per agent with a bounded backoff.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::constraints::ConstraintService;
use crate::context::ToolContext;
use crate::error::ConstraintError;
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str, string_list};

const ACTIONS: &[&str] = &["status", "add", "commit", "push", "checkout"];

/// How many times `push` waits out a rate limit before giving up.
const MAX_PUSH_ATTEMPTS: u32 = 3;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct GitTool {
    constraints: Arc<ConstraintService>,
    timeout: Duration,
}

impl GitTool {
    pub fn new(constraints: Arc<ConstraintService>) -> Self {
        Self {
            constraints,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn repo(&self) -> PathBuf {
        self.constraints.root().to_path_buf()
    }

    fn check_args(&self, args: &[&str]) -> Result<(), ToolError> {
        for arg in args {
            self.constraints.validate_git_arg(arg)?;
        }
        Ok(())
    }

    /// Wait out rate-limit rejections, up to `MAX_PUSH_ATTEMPTS` checks.
    async fn wait_for_rate_limit(&self, agent: &str) -> Result<(), ToolError> {
        let mut attempt = 1;
        loop {
            match self.constraints.validate_rate_limit(agent) {
                Ok(()) => return Ok(()),
                Err(ConstraintError::RateLimited { retry_after, .. })
                    if attempt < MAX_PUSH_ATTEMPTS =>
                {
                    debug!(agent, attempt, ?retry_after, "Push rate limited, backing off");
                    tokio::time::sleep(retry_after).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, ToolError> {
        let child = Command::new("git")
            .args(args)
            .current_dir(self.repo())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to spawn git: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::ExecutionFailed(format!("git failed: {e}"))),
            Err(_) => return Err(ToolError::Timeout(self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::ExecutionFailed(format!(
                "git {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }

    async fn add(&self, params: &serde_json::Value) -> Result<String, ToolError> {
        let mut files = string_list(params, "files")?;
        if files.is_empty() {
            files.push(".".to_string());
        }
        for file in &files {
            self.constraints.validate_git_arg(file)?;
            self.constraints.validate_path_safety(file)?;
        }
        self.constraints.validate_git_lock(&self.repo())?;

        let mut args = vec!["add", "--"];
        args.extend(files.iter().map(String::as_str));
        self.run_git(&args).await
    }

    async fn commit(&self, params: &serde_json::Value) -> Result<String, ToolError> {
        let message = require_str(params, "message")?;
        if message.trim().is_empty() {
            return Err(ToolError::InvalidParameters("empty commit message".into()));
        }
        self.check_args(&[message])?;
        self.constraints.validate_git_lock(&self.repo())?;
        self.run_git(&["commit", "-m", message]).await
    }

    async fn push(&self, params: &serde_json::Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let remote = params
            .get("remote")
            .and_then(|v| v.as_str())
            .unwrap_or("origin");
        let branch = params.get("branch").and_then(|v| v.as_str());

        let mut args = vec!["push", remote];
        args.extend(branch);
        for name in &args[1..] {
            self.constraints.validate_git_ref(name)?;
        }
        self.constraints.validate_git_lock(&self.repo())?;
        self.wait_for_rate_limit(&ctx.agent).await?;

        info!(task_id = %ctx.task_id, remote, branch = branch.unwrap_or("HEAD"), "Pushing");
        self.run_git(&args).await
    }

    async fn checkout(&self, params: &serde_json::Value) -> Result<String, ToolError> {
        let branch = require_str(params, "branch")?;
        let create = params
            .get("create")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        self.constraints.validate_git_ref(branch)?;
        self.constraints.validate_git_lock(&self.repo())?;

        if create {
            self.run_git(&["checkout", "-b", branch]).await
        } else {
            self.run_git(&["checkout", branch]).await
        }
    }
}

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str {
        "git"
    }

    fn description(&self) -> &str {
        "Git operations on the workspace repository: status, add, commit, push, checkout."
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
        let output = match action {
            "status" => self.run_git(&["status", "--porcelain=v1", "--branch"]).await?,
            "add" => self.add(&params).await?,
            "commit" => self.commit(&params).await?,
            "push" => self.push(&params, ctx).await?,
            "checkout" => self.checkout(&params).await?,
            other => return Err(self.unknown_action(other)),
        };

        Ok(ToolOutput::success(
            serde_json::json!({ "action": action, "output": output }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use tempfile::TempDir;

    async fn tool_with_window(dir: &TempDir, window: Duration) -> GitTool {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let constraints =
            ConstraintService::new(dir.path(), store).with_rate_limit_window(window);
        GitTool::new(Arc::new(constraints))
    }

    async fn tool(dir: &TempDir) -> GitTool {
        tool_with_window(dir, Duration::from_millis(1000)).await
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn lock_marker_blocks_mutations() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/index.lock"), "").unwrap();
        let tool = tool(&dir).await;
        let ctx = ToolContext::default();

        for (action, params) in [
            ("commit", serde_json::json!({"message": "wip"})),
            ("add", serde_json::json!({"files": ["a.txt"]})),
            ("checkout", serde_json::json!({"branch": "main"})),
        ] {
            let err = tool.execute(action, params, &ctx).await.unwrap_err();
            assert!(
                matches!(err, ToolError::Constraint(ConstraintError::ResourceLocked { .. })),
                "{action}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn injection_in_arguments_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir).await;
        let ctx = ToolContext::default();

        let cases = [
            ("commit", serde_json::json!({"message": "x; rm -rf ."})),
            ("checkout", serde_json::json!({"branch": "$(whoami)"})),
            ("push", serde_json::json!({"remote": "origin", "branch": "--force"})),
            ("push", serde_json::json!({"branch": ":main"})),
            ("push", serde_json::json!({"remote": "--repo=http://evil"})),
            ("push", serde_json::json!({"remote": "https://evil.example/repo.git"})),
            ("checkout", serde_json::json!({"branch": "-b"})),
            ("add", serde_json::json!({"files": ["../outside"]})),
        ];
        for (action, params) in cases {
            let err = tool.execute(action, params, &ctx).await.unwrap_err();
            assert!(
                matches!(err, ToolError::Constraint(ConstraintError::Validation { .. })),
                "{action}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn unknown_subcommand_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir).await;
        let err = tool
            .execute("reset", serde_json::json!({}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownAction { .. }));
    }

    #[tokio::test]
    async fn rate_limit_backoff_waits_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let tool = tool_with_window(&dir, Duration::from_millis(50)).await;

        tool.constraints.validate_rate_limit("pusher").unwrap();
        let started = std::time::Instant::now();
        tool.wait_for_rate_limit("pusher").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn status_add_commit_in_real_repo() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let init = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap()
        };
        init(&["init", "-q"]);
        init(&["config", "user.email", "agent@example.com"]);
        init(&["config", "user.name", "Agent"]);
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let tool = tool(&dir).await;
        let ctx = ToolContext::default();

        let status = tool.execute("status", serde_json::json!({}), &ctx).await.unwrap();
        assert!(status.result["output"].as_str().unwrap().contains("a.txt"));

        tool.execute("add", serde_json::json!({"files": ["a.txt"]}), &ctx)
            .await
            .unwrap();
        tool.execute("commit", serde_json::json!({"message": "add a"}), &ctx)
            .await
            .unwrap();

        let status = tool.execute("status", serde_json::json!({}), &ctx).await.unwrap();
        assert!(!status.result["output"].as_str().unwrap().contains("a.txt"));
    }
}
