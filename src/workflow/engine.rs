//! Workflow engine.
//!
//! Drives externally-defined business processes (bug triage, git lifecycle,
//! environment bring-up) through persisted, versioned state machines. The
//! engine holds no per-instance state: callers pass the current state and
//! context on every call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::audit::TransitionLog;
use crate::error::WorkflowError;
use crate::store::Database;
use crate::telemetry::{TelemetrySink, TransitionEvent};
use crate::workflow::model::{
    WorkflowDefinition, WorkflowEvent, WorkflowTransition, WorkflowTransitionResult,
    WorkflowUpdate,
};
use crate::worker::state::create_log_entry;

/// Strategy forced onto escalated workflows.
pub const ESCALATION_STRATEGY: &str = "three-tier";

pub type WorkflowContext = Map<String, Value>;

/// Handler bound to a state through `metadata.auto_actions`.
#[async_trait]
pub trait AutoAction: Send + Sync {
    async fn run(&self, workflow: &str, state: &str, context: &WorkflowContext)
    -> Result<(), String>;
}

pub struct WorkflowEngine {
    store: Arc<dyn Database>,
    audit: TransitionLog,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    tactical_roles: Vec<String>,
    /// Active definitions by name. Entries live until `update_workflow`.
    cache: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    actions: RwLock<HashMap<String, Arc<dyn AutoAction>>>,
    paused: AtomicBool,
    paused_workflows: RwLock<HashSet<String>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn Database>, tactical_roles: Vec<String>) -> Self {
        Self {
            audit: TransitionLog::new(Arc::clone(&store)),
            store,
            telemetry: None,
            tactical_roles,
            cache: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            paused_workflows: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Fetch the active definition, caching it by name.
    ///
    /// A miss fetches under the cache write lock so a concurrent
    /// `update_workflow` cannot be overwritten by a stale read.
    pub async fn load_workflow(&self, name: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        if let Some(def) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(def));
        }

        let mut cache = self.cache.write().await;
        if let Some(def) = cache.get(name) {
            return Ok(Arc::clone(def));
        }
        let def = self
            .store
            .get_active_workflow(name)
            .await?
            .ok_or_else(|| WorkflowError::NotFound {
                name: name.to_string(),
            })?;
        let def = Arc::new(def);
        cache.insert(name.to_string(), Arc::clone(&def));
        tracing::debug!(workflow = %name, version = def.version, "Loaded workflow");
        Ok(def)
    }

    /// Compute the next state of `workflow_name` from `current_state`.
    ///
    /// Candidates are transitions whose `from` and `event` match, taken in
    /// definition order; the first whose condition holds wins. Escalated
    /// contexts always run with the three-tier strategy.
    pub async fn transition(
        &self,
        workflow_name: &str,
        current_state: &str,
        event: &WorkflowEvent,
        context: WorkflowContext,
    ) -> Result<WorkflowTransitionResult, WorkflowError> {
        if let Some(scope) = self.paused_scope(workflow_name).await {
            return Err(WorkflowError::Paused { scope });
        }

        let def = self.load_workflow(workflow_name).await?;
        let context = self.apply_escalation(context);

        let chosen = select_transition(&def.transitions, current_state, &event.event_type, &context)
            .ok_or_else(|| WorkflowError::NoValidTransition {
                workflow: workflow_name.to_string(),
                state: current_state.to_string(),
                event: event.event_type.clone(),
            })?;

        self.run_auto_action(&def, &chosen.from, &context).await?;
        if chosen.to != chosen.from {
            self.run_auto_action(&def, &chosen.to, &context).await?;
        }

        self.record(workflow_name, &chosen.from, &chosen.to, &context)
            .await;
        tracing::info!(
            workflow = %workflow_name,
            from = %chosen.from,
            to = %chosen.to,
            event = %event.event_type,
            "Workflow transition"
        );

        Ok(WorkflowTransitionResult {
            from_state: chosen.from.clone(),
            to_state: chosen.to.clone(),
            event: event.event_type.clone(),
            context,
        })
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        Ok(self.store.list_active_workflows().await?)
    }

    pub async fn get_workflow(&self, name: &str) -> Result<WorkflowDefinition, WorkflowError> {
        Ok(self.load_workflow(name).await?.as_ref().clone())
    }

    /// Replace a definition. Both `name` and `definition` are required;
    /// omitted metadata keeps the current metadata.
    pub async fn update_workflow(
        &self,
        name: &str,
        update: WorkflowUpdate,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let new_name = update
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| WorkflowError::InvalidDefinition("name is required".to_string()))?;
        let graph = update.definition.ok_or_else(|| {
            WorkflowError::InvalidDefinition("definition is required".to_string())
        })?;
        graph.validate()?;

        let mut cache = self.cache.write().await;
        let updated = self
            .store
            .update_workflow(name, &new_name, &graph, update.metadata.as_ref())
            .await?
            .ok_or_else(|| WorkflowError::NotFound {
                name: name.to_string(),
            })?;
        cache.remove(name);
        cache.remove(&new_name);
        drop(cache);

        tracing::info!(workflow = %name, new_name = %new_name, version = updated.version, "Workflow updated");
        Ok(updated)
    }

    /// Bind `name` to a handler. Replaces any previous handler.
    pub async fn register_action(&self, name: impl Into<String>, action: Arc<dyn AutoAction>) {
        self.actions.write().await.insert(name.into(), action);
    }

    pub async fn has_action(&self, name: &str) -> bool {
        self.actions.read().await.contains_key(name)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("Workflow engine paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("Workflow engine resumed");
    }

    pub async fn pause_workflow(&self, name: &str) {
        self.paused_workflows.write().await.insert(name.to_string());
        tracing::info!(workflow = %name, "Workflow paused");
    }

    pub async fn resume_workflow(&self, name: &str) {
        self.paused_workflows.write().await.remove(name);
        tracing::info!(workflow = %name, "Workflow resumed");
    }

    pub async fn is_paused(&self, name: &str) -> bool {
        self.paused_scope(name).await.is_some()
    }

    async fn paused_scope(&self, name: &str) -> Option<String> {
        if self.paused.load(Ordering::SeqCst) {
            return Some("engine".to_string());
        }
        if self.paused_workflows.read().await.contains(name) {
            return Some(format!("workflow '{name}'"));
        }
        None
    }

    fn apply_escalation(&self, mut context: WorkflowContext) -> WorkflowContext {
        let from_tactical = context
            .get("escalatedFrom")
            .and_then(Value::as_str)
            .is_some_and(|role| self.tactical_roles.iter().any(|r| r == role));
        let bug_escalation = context.get("isBugEscalation").is_some_and(is_truthy);

        if from_tactical || bug_escalation {
            context.insert(
                "strategy".to_string(),
                Value::String(ESCALATION_STRATEGY.to_string()),
            );
        }
        context
    }

    async fn run_auto_action(
        &self,
        def: &WorkflowDefinition,
        state: &str,
        context: &WorkflowContext,
    ) -> Result<(), WorkflowError> {
        let Some(action_name) = def.metadata.auto_actions.get(state) else {
            return Ok(());
        };
        let action = self.actions.read().await.get(action_name).cloned();
        let Some(action) = action else {
            tracing::debug!(workflow = %def.name, action = %action_name, "Auto action not registered");
            return Ok(());
        };
        action
            .run(&def.name, state, context)
            .await
            .map_err(|reason| WorkflowError::ActionFailed {
                action: action_name.clone(),
                reason,
            })
    }

    async fn record(&self, workflow: &str, from: &str, to: &str, context: &WorkflowContext) {
        let subtask_id = context
            .get("subtaskId")
            .and_then(Value::as_str)
            .unwrap_or(workflow);
        let entry = create_log_entry(from, to, &format!("workflow:{workflow}"), subtask_id);
        let entry = self.audit.record(entry).await;
        if let Some(sink) = &self.telemetry
            && let Err(e) = sink.publish(TransitionEvent::from(&entry))
        {
            tracing::debug!(workflow = %workflow, error = %e, "Telemetry publish skipped");
        }
    }
}

/// First transition in definition order matching `state`, `event` and its
/// condition.
fn select_transition<'a>(
    transitions: &'a [WorkflowTransition],
    state: &str,
    event: &str,
    context: &WorkflowContext,
) -> Option<&'a WorkflowTransition> {
    transitions.iter().find(|t| {
        t.from == state
            && t.event == event
            && t.condition
                .as_deref()
                .is_none_or(|c| condition_holds(c, context))
    })
}

/// `"key:value"` requires `context[key]` to equal `value`. A bare `"key"`
/// requires it to be truthy.
fn condition_holds(condition: &str, context: &WorkflowContext) -> bool {
    match condition.split_once(':') {
        Some((key, expected)) => match context.get(key.trim()) {
            Some(Value::String(s)) => s == expected.trim(),
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == expected.trim(),
        },
        None => context.get(condition.trim()).is_some_and(is_truthy),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
