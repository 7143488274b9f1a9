use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;

use agent_jobs::agent::{AgentDeps, AgentExecutor, Persona};
use agent_jobs::config::Config;
use agent_jobs::jobs::{Job, Queue};
use agent_jobs::llm::{LlmProvider, create_provider};
use agent_jobs::store::{
    AnnotationStore, AuditLog, JobRepository, LibSqlStore, QueueRepository,
};
use agent_jobs::tools::ToolRegistry;
use agent_jobs::tools::builtin::register_builtin_tools;
use agent_jobs::worker::{Processor, WorkerLoop};

const USAGE: &str = "usage: agent-jobs [run] | agent-jobs enqueue <goal> [priority] [queue]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref())?;

    let store = Arc::new(
        LibSqlStore::new_local(&config.database_path)
            .await
            .with_context(|| format!("failed to open {}", config.database_path.display()))?,
    );

    let mut queues = Vec::with_capacity(config.queues.len());
    for name in &config.queues {
        queues.push(ensure_queue(store.as_ref(), name).await?);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run(config, store, queues).await,
        Some("enqueue") => {
            let goal = args.get(1).context(USAGE)?;
            let priority = match args.get(2) {
                Some(p) => p.parse::<i64>().with_context(|| format!("bad priority {p:?}"))?,
                None => 0,
            };
            let queue = match args.get(3) {
                Some(name) => ensure_queue(store.as_ref(), name).await?,
                None => queues.first().cloned().context("no queue configured")?,
            };
            let job = Job::new(queue.id, goal.clone(), serde_json::json!({ "goal": goal }))
                .with_priority(priority)?
                .with_max_attempts(config.worker.default_max_attempts);
            store.add(&job).await?;
            tracing::info!(job_id = %job.id, queue = %queue.name, priority, "Enqueued job");
            println!("{}", job.id);
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "agent-jobs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            Ok(None)
        }
    }
}

async fn ensure_queue(store: &LibSqlStore, name: &str) -> anyhow::Result<Queue> {
    if let Some(queue) = store.find_queue_by_name(name).await? {
        return Ok(queue);
    }
    let queue = store.create_queue(name).await?;
    tracing::info!(queue = %queue.name, queue_id = %queue.id, "Created queue");
    Ok(queue)
}

async fn run(config: Config, store: Arc<LibSqlStore>, queues: Vec<Queue>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.sandbox.root).with_context(|| {
        format!(
            "failed to create sandbox root {}",
            config.sandbox.root.display()
        )
    })?;

    let annotations: Arc<dyn AnnotationStore> = store.clone();
    let audit: Arc<dyn AuditLog> = store.clone();

    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools, &config.sandbox, Some(Arc::clone(&annotations)))
        .await;

    let llm: Option<Arc<dyn LlmProvider>> = match create_provider(&config.llm) {
        Ok(provider) => {
            tracing::info!(model = %provider.model_name(), "Completion service ready");
            Some(provider)
        }
        Err(e) => {
            tracing::warn!(error = %e, "No completion service; agent turns will fail until configured");
            None
        }
    };

    let deps = AgentDeps::new(llm, tools)
        .with_annotations(annotations)
        .with_audit(audit);
    let processor: Arc<dyn Processor> = Arc::new(AgentExecutor::new(
        Persona::from(&config.persona),
        deps,
        config.executor.clone(),
    ));

    let jobs: Arc<dyn JobRepository> = store.clone();
    let queue_repo: Arc<dyn QueueRepository> = store.clone();

    let mut loops = Vec::with_capacity(queues.len());
    let mut handles = Vec::new();
    for queue in &queues {
        let recovered = jobs.requeue_orphaned_jobs(queue.id).await?;
        if recovered > 0 {
            tracing::warn!(queue = %queue.name, recovered, "Requeued jobs left active by a previous run");
        }

        let worker = Arc::new(WorkerLoop::new(
            queue,
            Arc::clone(&jobs),
            Arc::clone(&queue_repo),
            Arc::clone(&processor),
            config.worker.clone(),
        ));
        handles.extend(worker.start());
        loops.push(worker);
    }

    tracing::info!(
        queues = queues.len(),
        db = %config.database_path.display(),
        "Agent jobs running; Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    for worker in &loops {
        worker.stop();
    }

    let grace = config.worker.shutdown_grace;
    if tokio::time::timeout(grace, futures::future::join_all(handles))
        .await
        .is_err()
    {
        let busy: usize = loops.iter().map(|w| w.in_flight()).sum();
        tracing::warn!(
            grace_secs = grace.as_secs(),
            in_flight = busy,
            "Shutdown grace period elapsed with turns still running"
        );
    }

    tracing::info!("Stopped");
    Ok(())
}
