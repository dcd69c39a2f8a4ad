//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default step budget for a single executor run.
pub const DEFAULT_MAX_STEPS: u32 = 20;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum FSM iterations before a run is force-failed.
    pub max_steps: u32,
    /// Number of concurrent workers the binary spawns.
    pub worker_count: usize,
    /// How long an idle worker sleeps before polling the queue again.
    pub poll_interval: Duration,
    /// Token ceiling passed to the reasoning backend.
    pub max_tokens: u64,
    /// Sampling temperature passed to the reasoning backend.
    pub temperature: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            worker_count: 4,
            poll_interval: Duration::from_millis(1000),
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_steps: env_or("AGENT_MAX_STEPS", defaults.max_steps)?,
            worker_count: env_or("AGENT_WORKERS", defaults.worker_count)?,
            poll_interval: Duration::from_millis(env_or("AGENT_POLL_MS", 1000u64)?),
            max_tokens: env_or("AGENT_MAX_TOKENS", defaults.max_tokens)?,
            temperature: env_or("AGENT_TEMPERATURE", defaults.temperature)?,
        })
    }
}

/// Tool sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Every filesystem, shell and git operation is confined to this root.
    pub root: PathBuf,
    /// Timeout applied to each shell segment and git invocation.
    pub shell_timeout: Duration,
    /// Minimum spacing between rate-limited requests of one agent.
    pub rate_limit_window: Duration,
    /// Whether the filesystem tool consults stored path permissions.
    pub enforce_permissions: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./workspace"),
            shell_timeout: Duration::from_secs(120),
            rate_limit_window: Duration::from_millis(1000),
            enforce_permissions: false,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            root: std::env::var("AGENT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./workspace")),
            shell_timeout: Duration::from_secs(env_or("AGENT_SHELL_TIMEOUT_SECS", 120u64)?),
            rate_limit_window: Duration::from_millis(env_or("AGENT_RATE_LIMIT_MS", 1000u64)?),
            enforce_permissions: env_or("AGENT_ENFORCE_PERMISSIONS", false)?,
        })
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Agent identities whose escalations force the three-tier strategy.
    pub tactical_roles: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            tactical_roles: vec!["devon".to_string()],
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        match std::env::var("AGENT_TACTICAL_ROLES") {
            Ok(raw) => Self {
                tactical_roles: raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            Err(_) => Self::default(),
        }
    }
}

/// Full application configuration assembled by the binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub executor: ExecutorConfig,
    pub sandbox: SandboxConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: std::env::var("AGENT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/agent-core.db")),
            log_dir: std::env::var("AGENT_LOG_DIR").ok().map(PathBuf::from),
            executor: ExecutorConfig::from_env()?,
            sandbox: SandboxConfig::from_env()?,
            workflow: WorkflowConfig::from_env(),
        })
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn sandbox_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.rate_limit_window, Duration::from_millis(1000));
        assert!(!config.enforce_permissions);
    }

    #[test]
    fn parse_value_accepts_valid_numbers() {
        let v: u32 = parse_value("AGENT_MAX_STEPS", " 42 ").unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn parse_value_rejects_garbage() {
        let err = parse_value::<u32>("AGENT_MAX_STEPS", "lots").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, message } => {
                assert_eq!(key, "AGENT_MAX_STEPS");
                assert!(message.contains("lots"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn tactical_roles_default_to_devon() {
        assert_eq!(WorkflowConfig::default().tactical_roles, vec!["devon"]);
    }
}
