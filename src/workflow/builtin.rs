//! Stock workflow definitions seeded at startup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::store::Database;
use crate::workflow::engine::{AutoAction, WorkflowContext, WorkflowEngine};
use crate::workflow::model::{WorkflowDefinition, WorkflowGraph, WorkflowMetadata, WorkflowTransition};

fn states(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Bug reports either get a direct fix or, when escalated, the three-tier
/// analyze / plan / implement route.
pub fn bug_triage() -> WorkflowDefinition {
    let graph = WorkflowGraph {
        states: states(&[
            "reported",
            "triaged",
            "analyzing",
            "planning",
            "fixing",
            "verifying",
            "resolved",
            "rejected",
        ]),
        transitions: vec![
            WorkflowTransition::new("reported", "TRIAGE", "triaged"),
            WorkflowTransition::new("reported", "REJECT", "rejected"),
            WorkflowTransition::new("triaged", "ASSIGN", "analyzing").when("strategy:three-tier"),
            WorkflowTransition::new("triaged", "ASSIGN", "fixing"),
            WorkflowTransition::new("analyzing", "ANALYSIS_COMPLETE", "planning"),
            WorkflowTransition::new("planning", "PLAN_APPROVED", "fixing"),
            WorkflowTransition::new("fixing", "FIX_READY", "verifying"),
            WorkflowTransition::new("verifying", "TESTS_PASSED", "resolved"),
            WorkflowTransition::new("verifying", "TESTS_FAILED", "analyzing")
                .when("strategy:three-tier"),
            WorkflowTransition::new("verifying", "TESTS_FAILED", "fixing"),
        ],
    };
    let mut metadata = WorkflowMetadata::default();
    metadata.roles.insert("analyzing".into(), "orchestrator".into());
    metadata.roles.insert("planning".into(), "orchestrator".into());
    metadata.roles.insert("fixing".into(), "implementer".into());
    metadata.roles.insert("verifying".into(), "tester".into());
    metadata.max_loops = Some(3);
    WorkflowDefinition::new("bug-triage", graph, metadata)
}

/// Branch → commit → push → review → merge.
pub fn git_lifecycle() -> WorkflowDefinition {
    let graph = WorkflowGraph {
        states: states(&[
            "idle",
            "branched",
            "committed",
            "pushed",
            "in-review",
            "merged",
            "abandoned",
        ]),
        transitions: vec![
            WorkflowTransition::new("idle", "CREATE_BRANCH", "branched"),
            WorkflowTransition::new("branched", "COMMIT", "committed"),
            WorkflowTransition::new("committed", "COMMIT", "committed"),
            WorkflowTransition::new("committed", "PUSH", "pushed"),
            WorkflowTransition::new("pushed", "OPEN_REVIEW", "in-review"),
            WorkflowTransition::new("in-review", "CHANGES_REQUESTED", "branched"),
            WorkflowTransition::new("in-review", "APPROVE", "merged"),
            WorkflowTransition::new("branched", "ABANDON", "abandoned"),
            WorkflowTransition::new("committed", "ABANDON", "abandoned"),
            WorkflowTransition::new("in-review", "ABANDON", "abandoned"),
        ],
    };
    let mut metadata = WorkflowMetadata::default();
    metadata.timeouts.insert("in-review".into(), 86_400);
    metadata.auto_actions.insert("pushed".into(), "notify-push".into());
    WorkflowDefinition::new("git-lifecycle", graph, metadata)
}

/// Provision, install, start, health-check.
pub fn environment_bringup() -> WorkflowDefinition {
    let graph = WorkflowGraph {
        states: states(&[
            "pending",
            "provisioning",
            "installing",
            "starting",
            "health-check",
            "ready",
            "failed",
        ]),
        transitions: vec![
            WorkflowTransition::new("pending", "START", "provisioning"),
            WorkflowTransition::new("provisioning", "PROVISIONED", "installing"),
            WorkflowTransition::new("installing", "INSTALLED", "starting"),
            WorkflowTransition::new("starting", "STARTED", "health-check"),
            WorkflowTransition::new("health-check", "HEALTHY", "ready"),
            WorkflowTransition::new("health-check", "UNHEALTHY", "starting"),
            WorkflowTransition::new("provisioning", "ERROR", "failed"),
            WorkflowTransition::new("installing", "ERROR", "failed"),
            WorkflowTransition::new("starting", "ERROR", "failed"),
            WorkflowTransition::new("failed", "RETRY", "pending"),
        ],
    };
    let mut metadata = WorkflowMetadata::default();
    metadata.timeouts.insert("provisioning".into(), 600);
    metadata.timeouts.insert("installing".into(), 900);
    metadata.timeouts.insert("health-check".into(), 120);
    metadata.max_loops = Some(5);
    WorkflowDefinition::new("environment-bringup", graph, metadata)
}

pub fn builtin_workflows() -> Vec<WorkflowDefinition> {
    vec![bug_triage(), git_lifecycle(), environment_bringup()]
}

/// Insert builtin definitions that are not stored yet. Existing rows,
/// including edited ones, are left alone. Returns how many were inserted.
pub async fn seed_builtin_workflows(store: &Arc<dyn Database>) -> Result<usize, DatabaseError> {
    let mut inserted = 0;
    for def in builtin_workflows() {
        if store.insert_workflow(&def).await? {
            tracing::info!(workflow = %def.name, "Seeded builtin workflow");
            inserted += 1;
        }
    }
    Ok(inserted)
}

/// Announces that a workflow reached a state. Logs only; no external hook.
pub struct NotifyAction;

#[async_trait]
impl AutoAction for NotifyAction {
    async fn run(
        &self,
        workflow: &str,
        state: &str,
        context: &WorkflowContext,
    ) -> Result<(), String> {
        let branch = context
            .get("branch")
            .and_then(|v| v.as_str())
            .unwrap_or("HEAD");
        tracing::info!(workflow, state, branch, "Workflow notification");
        Ok(())
    }
}

/// Register the handlers the builtin definitions reference.
pub async fn register_builtin_actions(engine: &WorkflowEngine) {
    engine
        .register_action("notify-push", Arc::new(NotifyAction))
        .await;
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::workflow::model::WorkflowEvent;

    #[test]
    fn builtin_graphs_are_valid() {
        for def in builtin_workflows() {
            def.graph()
                .validate()
                .unwrap_or_else(|e| panic!("{}: {e}", def.name));
        }
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        assert_eq!(seed_builtin_workflows(&store).await.unwrap(), 3);
        assert_eq!(seed_builtin_workflows(&store).await.unwrap(), 0);
        assert_eq!(store.list_active_workflows().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn builtin_auto_actions_are_registered() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        seed_builtin_workflows(&store).await.unwrap();
        let engine = WorkflowEngine::new(Arc::clone(&store), vec![]);
        register_builtin_actions(&engine).await;

        for def in builtin_workflows() {
            for action in def.metadata.auto_actions.values() {
                assert!(engine.has_action(action).await, "{}: {action}", def.name);
            }
        }

        let result = engine
            .transition("git-lifecycle", "committed", &WorkflowEvent::new("PUSH"), Map::new())
            .await
            .unwrap();
        assert_eq!(result.to_state, "pushed");
    }
}
