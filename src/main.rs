use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_core::audit::TransitionLog;
use agent_core::config::AppConfig;
use agent_core::constraints::ConstraintService;
use agent_core::llm::{LlmConfig, create_provider};
use agent_core::queue::{TaskQueue, TaskStatus};
use agent_core::store::{Database, LibSqlBackend};
use agent_core::telemetry::{BroadcastSink, TelemetrySink};
use agent_core::tools::builtin_registry;
use agent_core::worker::{
    Executor, ExecutorDeps, FencedJsonExtractor, PassThroughHooks, spawn_worker,
};
use agent_core::workflow::{
    WorkflowContext, WorkflowEngine, WorkflowEvent, register_builtin_actions,
    seed_builtin_workflows,
};

const USAGE: &str = "usage: agent-core [enqueue <type> <json-payload> | status | workflows \
                     | transition <workflow> <state> <event> [json-context]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config);

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    seed_builtin_workflows(&db).await?;
    let queue = TaskQueue::new(Arc::clone(&db));

    let telemetry = BroadcastSink::new();
    let _forwarder = telemetry.spawn_log_forwarder();
    let engine = WorkflowEngine::new(Arc::clone(&db), config.workflow.tactical_roles.clone())
        .with_telemetry(telemetry.clone());
    register_builtin_actions(&engine).await;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("enqueue") => {
            let (Some(task_type), Some(raw)) = (args.get(1), args.get(2)) else {
                anyhow::bail!(USAGE);
            };
            let payload: serde_json::Value =
                serde_json::from_str(raw).context("Payload must be valid JSON")?;
            let task = queue.enqueue(task_type, payload).await?;
            println!("{}", task.id);
            Ok(())
        }
        Some("status") => {
            println!("pending: {}", queue.get_pending_count().await?);
            for status in [TaskStatus::Running, TaskStatus::Completed, TaskStatus::Failed] {
                let tasks = queue.get_tasks_by_status(status).await?;
                println!("{status}: {}", tasks.len());
                if status == TaskStatus::Failed {
                    for task in tasks.iter().rev().take(10) {
                        let error = task.error.as_deref().unwrap_or("");
                        println!("  {} {}: {error}", task.id, task.task_type);
                    }
                }
            }
            Ok(())
        }
        Some("workflows") => {
            for def in engine.list_workflows().await? {
                println!("{} v{} ({} states)", def.name, def.version, def.states.len());
            }
            Ok(())
        }
        Some("transition") => {
            let (Some(workflow), Some(state), Some(event)) = (args.get(1), args.get(2), args.get(3))
            else {
                anyhow::bail!(USAGE);
            };
            let context: WorkflowContext = match args.get(4) {
                Some(raw) => serde_json::from_str(raw).context("Context must be a JSON object")?,
                None => WorkflowContext::new(),
            };
            let result = engine
                .transition(workflow, state, &WorkflowEvent::new(event.as_str()), context)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command '{other}'\n{USAGE}"),
        None => run_workers(config, db, queue, telemetry).await,
    }
}

async fn run_workers(
    config: AppConfig,
    db: Arc<dyn Database>,
    queue: TaskQueue,
    telemetry: Arc<dyn TelemetrySink>,
) -> anyhow::Result<()> {
    let llm = create_provider(&LlmConfig::from_env()?)?;

    std::fs::create_dir_all(&config.sandbox.root).with_context(|| {
        format!("Failed to create workspace root {}", config.sandbox.root.display())
    })?;
    let constraints = Arc::new(
        ConstraintService::new(config.sandbox.root.clone(), Arc::clone(&db))
            .with_rate_limit_window(config.sandbox.rate_limit_window),
    );
    let tools = Arc::new(builtin_registry(constraints, queue.clone(), &config.sandbox));

    let executor = Arc::new(Executor::new(ExecutorDeps {
        queue,
        llm,
        tools,
        extractor: Arc::new(FencedJsonExtractor::new()),
        hooks: Arc::new(PassThroughHooks),
        audit: TransitionLog::new(Arc::clone(&db)),
        telemetry,
        config: config.executor.clone(),
    }));

    eprintln!("🤖 Agent core v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Workspace: {}", config.sandbox.root.display());
    eprintln!("   Workers: {}", config.executor.worker_count);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = (0..config.executor.worker_count)
        .map(|i| {
            spawn_worker(
                Arc::clone(&executor),
                format!("worker-{i}"),
                config.executor.poll_interval,
                shutdown_rx.clone(),
            )
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for in-flight tasks");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task join failed");
        }
    }
    Ok(())
}

/// Log to stderr, plus a daily rolling file when `AGENT_LOG_DIR` is set.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-core.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}
