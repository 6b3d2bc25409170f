use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use taskcore::config::CoreConfig;
use taskcore::engine::{Engine, EngineDeps};
use taskcore::error::Failure;
use taskcore::events::{Event, Topic};
use taskcore::orchestrator::JobRequest;
use taskcore::runtime::{AgentConfig, entry_fn};
use taskcore::store::FileSnapshotStore;
use taskcore::task::{TaskRegistry, TaskStatus};
use taskcore::worker::{WorkerHandler, WorkerJob, WorkerScope};

/// Counts words, lines and characters of `payload.text` on a worker thread.
struct TextStats;

impl WorkerHandler for TextStats {
    fn handle(&self, job: &WorkerJob, scope: &WorkerScope) -> anyhow::Result<serde_json::Value> {
        let text = job
            .payload
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("payload has no text"))?;
        let mut words = 0usize;
        for (i, line) in text.lines().enumerate() {
            if scope.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            words += line.split_whitespace().count();
            scope.progress(json!({ "lines_done": i + 1 }));
        }
        Ok(json!({
            "words": words,
            "lines": text.lines().count(),
            "chars": text.chars().count(),
        }))
    }
}

/// Agent that hands its prompt to the worker pool as a heavy task.
fn analyze_agent(tasks: TaskRegistry) -> AgentConfig {
    AgentConfig::new(
        "analyze",
        entry_fn(move |input, env| {
            let tasks = tasks.clone();
            async move {
                let mut metadata = serde_json::Map::new();
                metadata.insert("payload".into(), json!({ "text": input.prompt }));
                let task = tasks.create_child_task("analyze_text", metadata, env.cancel_token());
                let settled = tasks
                    .execute_task(task.id, |_| async { Ok(serde_json::Value::Null) }.boxed())
                    .await?;
                match settled.status {
                    TaskStatus::Done => Ok(settled.result.unwrap_or_default()),
                    status => Err(settled
                        .error
                        .unwrap_or_else(|| Failure::execution(format!("analysis ended {status}")))
                        .into()),
                }
            }
        }),
    )
    .name("Text analyzer")
    .keywords(["analyze", "count", "stats"])
}

fn echo_agent() -> AgentConfig {
    AgentConfig::new(
        "echo",
        entry_fn(|input, env| async move {
            env.task().log(format!("echoing {} chars", input.prompt.len()))?;
            Ok(json!({ "echo": input.prompt }))
        }),
    )
    .name("Echo")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing, optionally mirrored to a daily log file
    let file_layer = std::env::var("TASKCORE_LOG_DIR").ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "taskcore.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false),
            guard,
        )
    });
    let (file_layer, _log_guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    let config = CoreConfig::from_env()?;
    eprintln!("taskcore");
    eprintln!("   Snapshots: {}", config.snapshot_dir.display());

    let mut deps = EngineDeps::new(Arc::new(FileSnapshotStore::new(config.snapshot_dir.clone())));
    deps.worker_handler = Some(Arc::new(TextStats));
    let engine = Engine::new(config, deps)?;

    engine.runtime().register_agent(echo_agent())?;
    engine
        .runtime()
        .register_agent(analyze_agent(engine.tasks().clone()))?;
    engine.runtime().set_default_agent("echo")?;
    eprintln!("   Agents: {}", engine.runtime().agent_ids().join(", "));

    engine.bus().on(Topic::JobCompleted, |event| {
        if let Event::JobCompleted { job } = event {
            let result = job.result.clone().unwrap_or_default();
            println!("\n[{}] {}\n", job.id, result);
        }
        Ok(())
    });
    engine.bus().on(Topic::JobFailed, |event| {
        if let Event::JobFailed { job } = event
            && let Some(error) = &job.error
        {
            println!("\n[{}] failed: {}\n", job.id, error);
        }
        Ok(())
    });

    let report = engine.start();
    if !report.interrupted.is_empty() {
        eprintln!("   Interrupted by last shutdown: {} task(s)", report.interrupted.len());
    }
    eprintln!("   Type a prompt, or /quit to exit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                match line {
                    "" => continue,
                    "/quit" => break,
                    "/jobs" => {
                        let stats = engine.orchestrator().stats();
                        eprintln!(
                            "pending={} running={} completed={} failed={} cancelled={}",
                            stats.pending, stats.running, stats.completed, stats.failed, stats.cancelled
                        );
                    }
                    prompt => {
                        let job = engine.orchestrator().enqueue(JobRequest::new(prompt));
                        eprintln!("queued {}", job.id);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Error reading stdin");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
