//! Agent executor: drives one claimed task through the FSM.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::TransitionLog;
use crate::config::ExecutorConfig;
use crate::context::ToolContext;
use crate::error::{Error, ExecutorError};
use crate::llm::{GenerateOptions, LlmProvider};
use crate::queue::{Task, TaskQueue};
use crate::telemetry::{TelemetrySink, TransitionEvent};
use crate::tools::{ToolRegistry, Toolset};
use crate::worker::context::{ExecutionContext, Plan};
use crate::worker::extract::ToolCallExtractor;
use crate::worker::hooks::StageHooks;
use crate::worker::state::{AgentEvent, AgentState, create_log_entry, transition, update_context};

const SYSTEM_PROMPT: &str = "You are an autonomous software development agent. \
    Work only through the tools listed in the prompt and keep changes minimal.";

/// Shared dependencies for executor runs.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub queue: TaskQueue,
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
    pub extractor: Arc<dyn ToolCallExtractor>,
    pub hooks: Arc<dyn StageHooks>,
    pub audit: TransitionLog,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub config: ExecutorConfig,
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task_id: Uuid,
    /// `Complete` or `Error`.
    pub final_state: AgentState,
    pub context: ExecutionContext,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        self.final_state == AgentState::Complete
    }
}

/// Identity of one in-flight run.
struct RunScope<'a> {
    task: &'a Task,
    role: String,
    subtask_id: String,
    toolset: Toolset,
    tool_ctx: ToolContext,
}

pub struct Executor {
    deps: ExecutorDeps,
}

impl Executor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.deps.queue
    }

    /// Claim the next pending task and run it. `None` if the queue was empty.
    pub async fn run_next(&self, worker_id: &str) -> Result<Option<RunOutcome>, Error> {
        match self.deps.queue.dequeue(worker_id).await? {
            Some(task) => Ok(Some(self.run_task(task).await?)),
            None => Ok(None),
        }
    }

    /// Run a claimed task to a terminal state and report it to the queue.
    ///
    /// Errors and panics escaping the loop are turned into `fail()`, so the
    /// task never stays `running`. Only queue failures are returned.
    pub async fn run_task(&self, task: Task) -> Result<RunOutcome, Error> {
        let task_id = task.id;
        info!(task_id = %task_id, task_type = %task.task_type, "Executor run starting");

        let run = AssertUnwindSafe(self.drive(&task)).catch_unwind().await;
        let outcome = match run {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(task_id = %task_id, error = %e, "Executor loop failed");
                self.deps.queue.fail(task_id, &e.to_string()).await?;
                return Ok(aborted(task_id, e.to_string()));
            }
            Err(panic) => {
                let message = ExecutorError::Panicked {
                    id: task_id,
                    reason: panic_reason(panic.as_ref()),
                }
                .to_string();
                error!(task_id = %task_id, error = %message, "Executor loop panicked");
                self.deps.queue.fail(task_id, &message).await?;
                return Ok(aborted(task_id, message));
            }
        };

        if outcome.is_complete() {
            let result = serde_json::json!({
                "context": outcome.context,
                "completed": true,
            });
            self.deps.queue.complete(task_id, result).await?;
        } else {
            let message = outcome
                .context
                .error
                .clone()
                .unwrap_or_else(|| "Task ended in ERROR".to_string());
            self.deps.queue.fail(task_id, &message).await?;
        }
        Ok(outcome)
    }

    /// The FSM loop. Step-level failures become `ERROR_OCCURRED` events;
    /// only logic gaps escape as `Err`.
    async fn drive(&self, task: &Task) -> Result<RunOutcome, Error> {
        let role = task.agent_role().to_string();
        let subtask_id = task.subtask_id();
        let toolset = self.deps.tools.toolset_for(&role).await;
        if toolset.is_empty() {
            warn!(task_id = %task.id, role = %role, "Role has no tools; any tool call will fail");
        }
        let scope = RunScope {
            task,
            tool_ctx: ToolContext::new(task.id, subtask_id.clone(), role.clone()),
            role,
            subtask_id,
            toolset,
        };

        let max_steps = self.deps.config.max_steps;
        let mut state = AgentState::Observe;
        let mut context = ExecutionContext::default();

        while !matches!(state, AgentState::Complete | AgentState::Error) {
            let event = if context.step_count >= max_steps {
                AgentEvent::error(ExecutorError::StepBudgetExceeded { max_steps }.to_string())
            } else {
                self.step(state, &scope, &context).await
            };

            let next = transition(state, &event, &context);
            if next == state {
                return Err(ExecutorError::Transition {
                    state: state.to_string(),
                    event: event.kind().to_string(),
                }
                .into());
            }
            context = update_context(state, &event, context);
            self.record_transition(state, next, &scope).await;
            state = next;
        }

        Ok(RunOutcome {
            task_id: task.id,
            final_state: state,
            context,
        })
    }

    async fn step(
        &self,
        state: AgentState,
        scope: &RunScope<'_>,
        context: &ExecutionContext,
    ) -> AgentEvent {
        match state {
            AgentState::Observe => self.observe(scope, context).await,
            AgentState::Think => self.think(context),
            AgentState::Act => self.act(scope, context).await,
            AgentState::Wait => self.deps.hooks.wait(context).await,
            AgentState::Verify => self.deps.hooks.verify(context).await,
            AgentState::Complete | AgentState::Error => {
                AgentEvent::error(format!("No work defined for terminal state {state}"))
            }
        }
    }

    async fn observe(&self, scope: &RunScope<'_>, context: &ExecutionContext) -> AgentEvent {
        let prompt = self.build_prompt(scope, context);
        let options = GenerateOptions::default()
            .with_max_tokens(self.deps.config.max_tokens)
            .with_temperature(self.deps.config.temperature)
            .with_system_prompt(SYSTEM_PROMPT);

        match self.deps.llm.generate(&prompt, &options).await {
            Ok(generation) => {
                debug!(
                    task_id = %scope.task.id,
                    model = %self.deps.llm.model_name(),
                    tokens = generation.usage.total(),
                    "Observation received"
                );
                AgentEvent::ObserveComplete {
                    observation: generation.content,
                }
            }
            Err(e) => AgentEvent::error(format!("Reasoning backend failed: {e}")),
        }
    }

    fn think(&self, context: &ExecutionContext) -> AgentEvent {
        let observation = context.last_observation.as_deref().unwrap_or_default();
        let calls = self.deps.extractor.extract(observation);
        AgentEvent::ThinkComplete {
            plan: Plan::with_calls(calls),
        }
    }

    /// Run every planned call in order. The first failure aborts the rest.
    async fn act(&self, scope: &RunScope<'_>, context: &ExecutionContext) -> AgentEvent {
        let mut results = Vec::with_capacity(context.tool_calls.len());
        for call in &context.tool_calls {
            let tool = match scope.toolset.get(&call.tool) {
                Ok(tool) => tool,
                Err(e) => return AgentEvent::error(e.to_string()),
            };
            debug!(task_id = %scope.task.id, call = %call.label(), "Invoking tool");
            match tool
                .execute(&call.action, call.params.clone(), &scope.tool_ctx)
                .await
            {
                Ok(output) => results.push(serde_json::json!({
                    "tool": call.tool,
                    "action": call.action,
                    "result": output.result,
                    "durationMs": output.duration.as_millis() as u64,
                })),
                Err(e) => {
                    return AgentEvent::error(format!("Tool {} failed: {e}", call.label()));
                }
            }
        }
        AgentEvent::ActionComplete { results }
    }

    fn build_prompt(&self, scope: &RunScope<'_>, context: &ExecutionContext) -> String {
        let task = scope.task;
        let tools = scope.toolset.names();
        let mut prompt = format!(
            "Task {id} ({task_type}) for role '{role}'.\n\nPayload:\n{payload}\n\n\
             Step {step}, retries so far: {retries}.\n",
            id = task.id,
            task_type = task.task_type,
            role = scope.role,
            payload = serde_json::to_string_pretty(&task.payload).unwrap_or_default(),
            step = context.step_count,
            retries = context.retry_count,
        );
        if let Some(results) = &context.action_result {
            prompt.push_str(&format!(
                "\nResults of the previous actions:\n{}\n",
                serde_json::to_string_pretty(results).unwrap_or_default()
            ));
        }
        if tools.is_empty() {
            prompt.push_str("\nNo tools are available for this role.\n");
        } else {
            prompt.push_str(&format!("\nAvailable tools: {}\n", tools.join(", ")));
            for name in &tools {
                if let Ok(tool) = scope.toolset.get(name) {
                    prompt.push_str(&format!(
                        "- {name} [{}]: {}\n",
                        tool.actions().join(", "),
                        tool.description()
                    ));
                }
            }
        }
        prompt.push('\n');
        prompt.push_str(&self.deps.extractor.format_instructions());
        prompt
    }

    /// Persist then publish. Neither failure affects the run.
    async fn record_transition(&self, from: AgentState, to: AgentState, scope: &RunScope<'_>) {
        let entry = create_log_entry(from, to, &scope.role, &scope.subtask_id);
        let entry = self.deps.audit.record(entry).await;
        if let Err(e) = self.deps.telemetry.publish(TransitionEvent::from(&entry)) {
            debug!(subtask_id = %scope.subtask_id, error = %e, "Telemetry publish skipped");
        }
        debug!(task_id = %scope.task.id, from = %from, to = %to, "Transition");
    }
}

fn aborted(task_id: Uuid, message: String) -> RunOutcome {
    RunOutcome {
        task_id,
        final_state: AgentState::Error,
        context: ExecutionContext {
            error: Some(message),
            ..Default::default()
        },
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Poll the queue until `shutdown` flips to `true`.
///
/// An idle worker sleeps for `poll_interval`; queue errors are logged and
/// retried after the same pause.
pub fn spawn_worker(
    executor: Arc<Executor>,
    worker_id: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(worker = %worker_id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match executor.run_next(&worker_id).await {
                Ok(Some(outcome)) => {
                    debug!(worker = %worker_id, task_id = %outcome.task_id, state = %outcome.final_state, "Run finished");
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "Worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(worker = %worker_id, "Worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Generation, TokenUsage};
    use crate::queue::TaskStatus;
    use crate::store::testing::FlakyStore;
    use crate::store::{Database, LibSqlBackend, SortOrder};
    use crate::telemetry::BroadcastSink;
    use crate::tools::{Tool, ToolError, ToolOutput};
    use crate::worker::extract::FencedJsonExtractor;
    use crate::worker::hooks::PassThroughHooks;

    /// Replies with canned responses, repeating the last one.
    struct StubLlm {
        replies: Mutex<Vec<Result<String, String>>>,
    }

    impl StubLlm {
        fn new(mut replies: Vec<Result<String, String>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<Generation, LlmError> {
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop().unwrap()
            } else {
                replies.last().cloned().unwrap()
            };
            match reply {
                Ok(content) => Ok(Generation {
                    content,
                    usage: TokenUsage::default(),
                }),
                Err(reason) => Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason,
                }),
            }
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "filesystem"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn actions(&self) -> &'static [&'static str] {
            &["read", "explode", "panic"]
        }
        async fn execute(
            &self,
            action: &str,
            params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            match action {
                "read" => Ok(ToolOutput::success(params, Duration::from_millis(1))),
                "panic" => panic!("tool blew up"),
                _ => Err(ToolError::ExecutionFailed("exploded".into())),
            }
        }
    }

    struct AlwaysFailVerify;

    #[async_trait]
    impl StageHooks for AlwaysFailVerify {
        async fn wait(&self, _context: &ExecutionContext) -> AgentEvent {
            AgentEvent::WaitComplete
        }
        async fn verify(&self, _context: &ExecutionContext) -> AgentEvent {
            AgentEvent::VerificationFailed
        }
    }

    struct Harness {
        executor: Executor,
        store: Arc<dyn Database>,
    }

    async fn harness(llm: Arc<dyn LlmProvider>, hooks: Arc<dyn StageHooks>) -> Harness {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(EchoTool)).await;
        let executor = Executor::new(ExecutorDeps {
            queue: TaskQueue::new(Arc::clone(&store)),
            llm,
            tools,
            extractor: Arc::new(FencedJsonExtractor),
            hooks,
            audit: TransitionLog::new(Arc::clone(&store)),
            telemetry: BroadcastSink::new(),
            config: ExecutorConfig::default(),
        });
        Harness { executor, store }
    }

    fn call(action: &str) -> String {
        format!(
            "```tool_call\n{{\"tool\":\"filesystem\",\"action\":\"{action}\",\"params\":{{\"path\":\"a.txt\"}}}}\n```"
        )
    }

    async fn run_one(h: &Harness, task_type: &str) -> (RunOutcome, Task) {
        let task = h
            .executor
            .queue()
            .enqueue(task_type, serde_json::json!({"subtaskId": "T1"}))
            .await
            .unwrap();
        let outcome = h.executor.run_next("w1").await.unwrap().unwrap();
        let stored = h.executor.queue().get_task(task.id).await.unwrap().unwrap();
        (outcome, stored)
    }

    #[tokio::test]
    async fn no_tool_calls_runs_to_completion() {
        let h = harness(StubLlm::new(vec![Ok("Nothing to do.".into())]), Arc::new(PassThroughHooks)).await;
        let (outcome, stored) = run_one(&h, "tester").await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.context.step_count, 5);
        assert_eq!(outcome.context.plan.as_ref().unwrap().content, "No tools needed");
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.unwrap()["completed"], true);

        let history = h.store.list_transitions("T1", SortOrder::Ascending).await.unwrap();
        let path: Vec<_> = history.iter().map(|e| e.to_state.as_str()).collect();
        assert_eq!(path, vec!["THINK", "ACT", "WAIT", "VERIFY", "COMPLETE"]);
        assert!(history.iter().all(|e| e.agent == "tester"));
    }

    #[tokio::test]
    async fn tool_results_are_recorded() {
        let h = harness(StubLlm::new(vec![Ok(call("read"))]), Arc::new(PassThroughHooks)).await;
        let (outcome, stored) = run_one(&h, "tester").await;

        assert!(outcome.is_complete());
        let results = outcome.context.action_result.unwrap();
        assert_eq!(results[0]["result"]["path"], "a.txt");
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn adapter_failure_fails_task() {
        let h = harness(StubLlm::new(vec![Err("503".into())]), Arc::new(PassThroughHooks)).await;
        let (outcome, stored) = run_one(&h, "tester").await;

        assert_eq!(outcome.final_state, AgentState::Error);
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().contains("Reasoning backend failed"));
    }

    #[tokio::test]
    async fn tool_failure_aborts_task() {
        let h = harness(
            StubLlm::new(vec![Ok(format!("{}\n{}", call("explode"), call("read")))]),
            Arc::new(PassThroughHooks),
        )
        .await;
        let (outcome, stored) = run_one(&h, "tester").await;

        assert_eq!(outcome.final_state, AgentState::Error);
        assert!(outcome.context.action_result.is_none());
        assert!(stored.error.unwrap().contains("Tool filesystem.explode failed"));
    }

    #[tokio::test]
    async fn unknown_role_fails_on_first_tool_reference() {
        let h = harness(StubLlm::new(vec![Ok(call("read"))]), Arc::new(PassThroughHooks)).await;
        let (_, stored) = run_one(&h, "stranger").await;

        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().contains("No tools available"));
    }

    #[tokio::test]
    async fn step_budget_forces_failure() {
        let h = harness(StubLlm::new(vec![Ok("No tools.".into())]), Arc::new(AlwaysFailVerify)).await;
        let (outcome, stored) = run_one(&h, "tester").await;

        assert_eq!(outcome.final_state, AgentState::Error);
        assert_eq!(outcome.context.step_count, 21);
        assert!(outcome.context.retry_count > 0);
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(
            stored.error.as_deref(),
            Some("Step budget exceeded (max 20 steps)")
        );
    }

    #[tokio::test]
    async fn audit_store_failure_does_not_abort_run() {
        let h = harness(StubLlm::new(vec![Ok(call("read"))]), Arc::new(PassThroughHooks)).await;
        let store = FlakyStore::new().await;
        store.fail_transitions(true);
        let queue = TaskQueue::new(store.clone());
        let executor = Executor::new(ExecutorDeps {
            queue: queue.clone(),
            audit: TransitionLog::new(store.clone()),
            ..h.executor.deps.clone()
        });

        let task = queue
            .enqueue("tester", serde_json::json!({"subtaskId": "T9"}))
            .await
            .unwrap();
        let outcome = executor.run_next("w1").await.unwrap().unwrap();

        assert!(outcome.is_complete());
        let stored = queue.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(
            store
                .list_transitions("T9", SortOrder::Ascending)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let h = harness(StubLlm::new(vec![Ok(call("panic"))]), Arc::new(PassThroughHooks)).await;
        let (outcome, stored) = run_one(&h, "tester").await;

        assert_eq!(outcome.final_state, AgentState::Error);
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().contains("tool blew up"));
    }

    #[tokio::test]
    async fn telemetry_is_published_per_transition() {
        let h = harness(StubLlm::new(vec![Ok("done".into())]), Arc::new(PassThroughHooks)).await;
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();
        let executor = Executor::new(ExecutorDeps {
            telemetry: sink,
            ..h.executor.deps.clone()
        });

        executor
            .queue()
            .enqueue("tester", serde_json::json!({}))
            .await
            .unwrap();
        executor.run_next("w1").await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.to);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last().unwrap(), "COMPLETE");
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let h = harness(StubLlm::new(vec![Ok("done".into())]), Arc::new(PassThroughHooks)).await;
        let queue = h.executor.queue().clone();
        let task = queue.enqueue("tester", serde_json::json!({})).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_worker(
            Arc::new(h.executor),
            "w1".into(),
            Duration::from_millis(10),
            rx,
        );

        for _ in 0..100 {
            let t = queue.get_task(task.id).await.unwrap().unwrap();
            if t.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        let t = queue.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
    }
}
