//! Tool registry and the static role → capability map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ExecutorError;
use crate::tools::tool::Tool;

/// Every capability name known to the sandbox.
pub const ALL_CAPABILITIES: &[&str] = &["filesystem", "git", "shell", "project", "database"];

/// Capabilities granted to `role`. Unknown roles get nothing.
pub fn capabilities_for(role: &str) -> &'static [&'static str] {
    match role {
        "implementer" => &["filesystem", "git", "shell", "project"],
        "tester" => &["filesystem", "git", "shell"],
        "orchestrator" => ALL_CAPABILITIES,
        _ => &[],
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Registered tool");
    }

    /// Register a tool (sync version for startup).
    pub fn register_sync(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Ok(mut tools) = self.tools.try_write() {
            tools.insert(name.clone(), tool);
            tracing::debug!(tool = %name, "Registered tool");
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// List all tool names.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the tools `role` may use. Capabilities without a registered
    /// tool are skipped.
    pub async fn toolset_for(&self, role: &str) -> Toolset {
        let tools = self.tools.read().await;
        let granted = capabilities_for(role)
            .iter()
            .filter_map(|cap| tools.get(*cap).map(|t| (cap.to_string(), Arc::clone(t))))
            .collect();
        Toolset {
            role: role.to_string(),
            tools: granted,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The tools one task run may invoke.
#[derive(Clone)]
pub struct Toolset {
    role: String,
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl Toolset {
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names in a stable order, for prompts.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Look up a tool. An empty toolset or a name outside it is fatal.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn Tool>, ExecutorError> {
        if self.tools.is_empty() {
            return Err(ExecutorError::NoTools {
                role: self.role.clone(),
            });
        }
        self.tools.get(name).ok_or_else(|| ExecutorError::UnknownTool {
            tool: name.to_string(),
            role: self.role.clone(),
        })
    }
}

impl std::fmt::Debug for Toolset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolset")
            .field("role", &self.role)
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ToolContext;
    use crate::tools::tool::{ToolError, ToolOutput};
    use async_trait::async_trait;
    use std::time::Duration;

    struct MockTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "A mock tool for testing"
        }
        fn actions(&self) -> &'static [&'static str] {
            &["noop"]
        }
        async fn execute(
            &self,
            _action: &str,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::success(
                serde_json::json!("mock"),
                Duration::from_millis(1),
            ))
        }
    }

    async fn registry_with(names: &[&'static str]) -> ToolRegistry {
        let registry = ToolRegistry::new();
        for name in names {
            registry.register(Arc::new(MockTool { name })).await;
        }
        registry
    }

    #[test]
    fn capability_map() {
        assert_eq!(
            capabilities_for("implementer"),
            &["filesystem", "git", "shell", "project"]
        );
        assert!(!capabilities_for("tester").contains(&"project"));
        assert!(capabilities_for("orchestrator").contains(&"database"));
        assert!(capabilities_for("stranger").is_empty());
    }

    #[tokio::test]
    async fn toolset_is_role_scoped() {
        let registry = registry_with(&["filesystem", "shell", "database"]).await;

        let tester = registry.toolset_for("tester").await;
        assert_eq!(tester.names(), vec!["filesystem", "shell"]);
        assert!(tester.get("shell").is_ok());
        assert!(matches!(
            tester.get("database"),
            Err(ExecutorError::UnknownTool { .. })
        ));

        let orchestrator = registry.toolset_for("orchestrator").await;
        assert!(orchestrator.get("database").is_ok());
    }

    #[tokio::test]
    async fn unknown_role_fails_closed() {
        let registry = registry_with(&["filesystem"]).await;
        let toolset = registry.toolset_for("stranger").await;
        assert!(toolset.is_empty());
        assert!(matches!(
            toolset.get("filesystem"),
            Err(ExecutorError::NoTools { .. })
        ));
    }

    #[tokio::test]
    async fn register_and_list() {
        let registry = registry_with(&["shell", "git"]).await;
        assert!(registry.has("git").await);
        assert!(!registry.has("project").await);
        assert_eq!(registry.list().await, vec!["git", "shell"]);
        assert_eq!(registry.get("shell").await.unwrap().name(), "shell");
    }
}
