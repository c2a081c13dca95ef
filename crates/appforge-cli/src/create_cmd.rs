//! `appforge create` command: run one creation in-process and stream its
//! log live.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use appforge_core::progress::{TaskLog, topic};
use appforge_core::{CreateNovelAppRequest, Orchestrator, Pipeline};

use crate::config::AppforgeConfig;
use crate::log_cmd::format_entry;

/// Read a request from a JSON file.
pub fn read_request(path: &Path) -> Result<CreateNovelAppRequest> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read request file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse request file {}", path.display()))
}

/// Run the create command.
///
/// Ctrl-C cancels the task; the cancellation takes effect at the next phase
/// boundary and rolls back whatever already happened.
pub async fn run_create(pool: &PgPool, config: &AppforgeConfig, request_path: &Path) -> Result<()> {
    let request = read_request(request_path)?;

    let log = TaskLog::postgres(pool.clone());
    let pipeline = Pipeline::standard(pool.clone(), config.layout.clone(), &config.limits);
    let orchestrator = Orchestrator::new(pool.clone(), pipeline, log, &config.limits);

    let task_id = Uuid::new_v4();
    println!("Task: {task_id} ({})", topic(task_id));

    let mut rx = orchestrator.log().subscribe(task_id);
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(entry) => println!("  {}", format_entry(&entry)),
                Err(RecvError::Lagged(skipped)) => {
                    println!("  ... {skipped} entries skipped, see `appforge log {task_id}`");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, cancelling at the next phase boundary");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator.run(task_id, &request, &cancel).await;

    // Rejected tasks never open a stream of their own; close it either way.
    orchestrator.log().finish(task_id);
    interrupt.abort();
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "log printer task failed");
    }

    let created = result?;
    println!();
    println!("Created app for {}/{}", request.user_id, request.base_config.app_name);
    if let Some(app_id) = created.app_id() {
        println!("  app id: {app_id}");
    }
    if let Some(dir) = created.target_dir() {
        println!("  directory: {}", dir.display());
    }
    Ok(())
}
