//! Constraint service: cross-cutting validators shared by every tool.
//!
//! Each validator either passes or returns a typed `ConstraintError`; none
//! of them silently no-op. Callers decide what is fatal: unsafe paths and
//! commands abort the task, locks and rate limits may be retried.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConstraintError;
use crate::store::Database;

/// Commands a shell segment may start with.
const ALLOWED_COMMANDS: &[&str] = &[
    "cargo", "cat", "cd", "cp", "diff", "echo", "find", "grep", "head", "ls", "mkdir", "mv",
    "node", "npm", "npx", "pnpm", "pwd", "pytest", "python", "python3", "sort", "tail", "touch",
    "wc", "yarn",
];

/// Substrings rejected anywhere in a shell command.
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf", "rm -fr", "rm -r ", "..", "$(", "${", "`", "mkfs", "dd if=", "chmod 777", ":(){",
    ";", "&", "|", ">", "<", "\n", "\r", "/etc/passwd", "/etc/shadow", "~/.ssh", ".bash_history",
    "id_rsa",
];

/// `find` primaries that delete files or run other programs.
const FIND_BLOCKED_ACTIONS: &[&str] = &[
    "-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fprint0", "-fprintf", "-fls",
];

/// Whole words rejected anywhere in a shell command.
const BLOCKED_WORDS: &[&str] = &["sudo", "su", "doas", "shutdown", "reboot", "chown"];

/// Substrings rejected in any git argument.
const GIT_BLOCKED_PATTERNS: &[&str] = &["$(", "`", ";", "|", "&", ">", "<", "\n", "\r", ".."];

/// Git flags that rewrite history, run helpers or bypass safety.
const GIT_BLOCKED_FLAGS: &[&str] = &[
    "-f", "--force", "--force-with-lease", "--hard", "--mirror", "--delete", "-D", "-c",
    "--exec", "--upload-pack", "--receive-pack", "--no-verify",
];

/// An exclusive claim on a concern within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub task_id: String,
    pub concern: String,
    pub agent_id: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Read,
    Write,
    Execute,
}

impl PermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        }
    }
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "execute" => Ok(Self::Execute),
            other => Err(format!("unknown permission '{other}'")),
        }
    }
}

/// A path rule for one agent. The highest-priority matching rule decides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub agent_id: String,
    pub path_pattern: String,
    pub permission: PermissionKind,
    pub allowed: bool,
    pub priority: i64,
}

/// Validators for paths, commands, git state, rate limits, locks and permissions.
pub struct ConstraintService {
    root: PathBuf,
    store: Arc<dyn Database>,
    rate_limit_window: Duration,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl ConstraintService {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn Database>) -> Self {
        Self {
            root: root.into(),
            store,
            rate_limit_window: Duration::from_millis(1000),
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rate_limit_window(mut self, window: Duration) -> Self {
        self.rate_limit_window = window;
        self
    }

    /// Sandbox root every path is resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    /// Resolve `path` against the root, rejecting anything that could escape it.
    ///
    /// Runs before any I/O touches the target. Returns the resolved path.
    pub fn validate_path_safety(&self, path: &str) -> Result<PathBuf, ConstraintError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(ConstraintError::validation("empty path"));
        }
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
            return Err(ConstraintError::validation(format!(
                "absolute path not allowed: {trimmed}"
            )));
        }
        for component in candidate.components() {
            match component {
                Component::ParentDir => {
                    return Err(ConstraintError::validation(format!(
                        "parent traversal not allowed: {trimmed}"
                    )));
                }
                Component::Prefix(_) | Component::RootDir => {
                    return Err(ConstraintError::validation(format!(
                        "absolute path not allowed: {trimmed}"
                    )));
                }
                _ => {}
            }
        }

        let resolved = normalize_lexical(&self.root.join(candidate));
        self.ensure_within_root(&resolved, trimmed)?;
        Ok(resolved)
    }

    /// Validate a directory the shell tool is about to `cd` into.
    pub fn validate_working_dir(&self, dir: &Path) -> Result<(), ConstraintError> {
        let display = dir.display().to_string();
        self.ensure_within_root(&normalize_lexical(dir), &display)
    }

    /// Symlinks inside the root may still point outside it: compare canonical
    /// forms of the nearest existing ancestor.
    fn ensure_within_root(&self, resolved: &Path, original: &str) -> Result<(), ConstraintError> {
        let root = canonical_or_lexical(&self.root);
        if !canonical_or_lexical(resolved).starts_with(&root) {
            return Err(ConstraintError::validation(format!(
                "path escapes sandbox root: {original}"
            )));
        }
        Ok(())
    }

    /// Two-stage command check: blocklist first, then the leading token
    /// must be whitelisted. `command` is a single segment (no `&&`).
    ///
    /// Every argument that could name a path must also pass
    /// `validate_path_safety`. Git is reachable only through the git tool.
    pub fn validate_command(&self, command: &str) -> Result<(), ConstraintError> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(ConstraintError::validation("empty command"));
        }
        if let Some(pattern) = BLOCKED_PATTERNS.iter().find(|p| trimmed.contains(**p)) {
            return Err(ConstraintError::validation(format!(
                "command contains blocked pattern '{pattern}': {trimmed}"
            )));
        }
        if let Some(word) = trimmed
            .split_whitespace()
            .find(|token| BLOCKED_WORDS.contains(token))
        {
            return Err(ConstraintError::validation(format!(
                "command uses blocked program '{word}': {trimmed}"
            )));
        }
        let mut tokens = trimmed.split_whitespace();
        let program = tokens.next().unwrap_or_default();
        if !ALLOWED_COMMANDS.contains(&program) {
            return Err(ConstraintError::validation(format!(
                "command '{program}' is not whitelisted"
            )));
        }

        for token in tokens {
            let token = token.trim_matches(['"', '\'']);
            if program == "find" && FIND_BLOCKED_ACTIONS.contains(&token) {
                return Err(ConstraintError::validation(format!(
                    "find action '{token}' is not allowed: {trimmed}"
                )));
            }
            let value = if token.starts_with('-') {
                match token.split_once('=') {
                    Some((_, value)) => value,
                    None => continue,
                }
            } else {
                token
            };
            let value = value.trim_matches(['"', '\'']);
            if value.is_empty() {
                continue;
            }
            if value.starts_with('~') {
                return Err(ConstraintError::validation(format!(
                    "home-relative path not allowed: {value}"
                )));
            }
            self.validate_path_safety(value)?;
        }
        Ok(())
    }

    /// Scan one git argument for injection or destructive patterns.
    pub fn validate_git_arg(&self, arg: &str) -> Result<(), ConstraintError> {
        if let Some(pattern) = GIT_BLOCKED_PATTERNS.iter().find(|p| arg.contains(**p)) {
            return Err(ConstraintError::validation(format!(
                "git argument contains blocked pattern '{pattern}': {arg}"
            )));
        }
        let flag = arg.split('=').next().unwrap_or(arg);
        if GIT_BLOCKED_FLAGS.contains(&flag) || (arg.starts_with('+') && arg.len() > 1) {
            return Err(ConstraintError::validation(format!(
                "git argument is destructive: {arg}"
            )));
        }
        Ok(())
    }

    /// Validate a remote or branch name passed as its own git argument.
    ///
    /// Must look like a plain ref: no leading `-`, `+` or `:` and no `:`
    /// anywhere, which rules out option injection, refspecs and URLs.
    pub fn validate_git_ref(&self, name: &str) -> Result<(), ConstraintError> {
        self.validate_git_arg(name)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConstraintError::validation("empty git ref"));
        }
        if name.starts_with(['-', '+', ':']) || name.contains(':') {
            return Err(ConstraintError::validation(format!(
                "git ref must be a plain name: {name}"
            )));
        }
        Ok(())
    }

    /// Reject when the repository lock marker exists.
    pub fn validate_git_lock(&self, repo: &Path) -> Result<(), ConstraintError> {
        let marker = repo.join(".git").join("index.lock");
        if marker.exists() {
            return Err(ConstraintError::ResourceLocked {
                resource: format!("git repository {}", repo.display()),
                holder: "index.lock".to_string(),
            });
        }
        Ok(())
    }

    /// At most one request per window per agent. A rejected call does not
    /// move the window.
    pub fn validate_rate_limit(&self, agent_id: &str) -> Result<(), ConstraintError> {
        let now = Instant::now();
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(previous) = last.get(agent_id) {
            let elapsed = now.duration_since(*previous);
            if elapsed < self.rate_limit_window {
                return Err(ConstraintError::RateLimited {
                    agent_id: agent_id.to_string(),
                    retry_after: self.rate_limit_window - elapsed,
                });
            }
        }
        last.insert(agent_id.to_string(), now);
        Ok(())
    }

    /// Take the concern lock. Re-entrant for the holder.
    pub async fn acquire_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
    ) -> Result<Lock, ConstraintError> {
        let lock = self
            .store
            .acquire_lock(task_id, concern, agent_id, Utc::now())
            .await?;
        if lock.agent_id != agent_id {
            debug!(task_id, concern, holder = %lock.agent_id, requester = agent_id, "Concern lock contended");
            return Err(ConstraintError::ResourceLocked {
                resource: format!("{task_id}/{concern}"),
                holder: lock.agent_id,
            });
        }
        Ok(lock)
    }

    /// Release the concern lock. Only the holder can release it.
    pub async fn release_lock(
        &self,
        task_id: &str,
        concern: &str,
        agent_id: &str,
    ) -> Result<bool, ConstraintError> {
        Ok(self.store.release_lock(task_id, concern, agent_id).await?)
    }

    pub async fn grant_permission(&self, permission: &Permission) -> Result<(), ConstraintError> {
        Glob::new(&permission.path_pattern).map_err(|e| {
            ConstraintError::validation(format!(
                "invalid path pattern '{}': {e}",
                permission.path_pattern
            ))
        })?;
        Ok(self.store.insert_permission(permission).await?)
    }

    /// Highest-priority matching rule wins; no match denies.
    ///
    /// Rules match against the normalized relative path, so `./a`, `a//b`
    /// and `a/b` hit the same rules. Paths that leave the root never match.
    pub async fn check_permission(
        &self,
        agent_id: &str,
        path: &str,
        kind: PermissionKind,
    ) -> Result<(), ConstraintError> {
        let denied = || ConstraintError::PermissionDenied {
            agent_id: agent_id.to_string(),
            path: path.to_string(),
            permission: kind.to_string(),
        };
        let key = permission_key(path).ok_or_else(denied)?;

        let rules = self.store.list_permissions(agent_id, kind).await?;
        for rule in rules {
            let matcher = match Glob::new(&rule.path_pattern) {
                Ok(glob) => glob.compile_matcher(),
                Err(e) => {
                    warn!(pattern = %rule.path_pattern, error = %e, "Skipping invalid permission pattern");
                    continue;
                }
            };
            if matcher.is_match(&key) {
                if rule.allowed {
                    return Ok(());
                }
                break;
            }
        }
        Err(denied())
    }
}

/// Relative path with `.` and empty segments removed. `None` for absolute
/// paths or any `..`.
fn permission_key(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the nearest existing ancestor and re-append the missing tail.
fn canonical_or_lexical(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let absolute = normalize_lexical(&absolute);

    let mut ancestor = absolute.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = ancestor.canonicalize() {
            return tail
                .into_iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (ancestor.file_name(), ancestor.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                ancestor = parent;
            }
            _ => return absolute,
        }
    }
}
