//! `appforge status` command: show one creation task or list recent ones.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use appforge_db::models::{CreationStatus, CreationTask};
use appforge_db::queries::creation_tasks as task_db;

/// Run the status command.
///
/// When `task_id_str` is `Some`, shows detail for that task. When `None`,
/// lists the `limit` most recent tasks.
pub async fn run_status(pool: &PgPool, task_id_str: Option<&str>, limit: i64) -> Result<()> {
    match task_id_str {
        Some(id_str) => run_task_status(pool, id_str).await,
        None => run_recent_status(pool, limit).await,
    }
}

async fn run_task_status(pool: &PgPool, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_creation_task(pool, task_id)
        .await?
        .with_context(|| format!("creation task {task_id} not found"))?;

    println!("Task: {}", task.id);
    println!("Target: {}/{}", task.user_id, task.app_name);
    println!("Status: {}", task.status);
    println!("Phase: {}/3", task.current_phase);
    if let Some(app_id) = task.app_id {
        println!("App: {app_id}");
    }
    println!("Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(started_at) = task.started_at {
        println!("Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed_at) = task.completed_at {
        println!("Completed: {}", completed_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &task.error {
        println!("Error: {error}");
    }

    Ok(())
}

async fn run_recent_status(pool: &PgPool, limit: i64) -> Result<()> {
    let tasks = task_db::list_creation_tasks(pool, limit).await?;

    if tasks.is_empty() {
        println!("No creation tasks found.");
        return Ok(());
    }

    println!(
        "    {:<36} {:<32} {:<12} {:>5}",
        "ID", "TARGET", "STATUS", "PHASE"
    );
    println!("{}", "-".repeat(92));
    for task in &tasks {
        println!(
            "[{}] {:<36} {:<32} {:<12} {:>5}",
            status_icon(task.status),
            task.id,
            target_display(task),
            task.status.to_string(),
            format!("{}/3", task.current_phase)
        );
    }

    Ok(())
}

fn status_icon(status: CreationStatus) -> char {
    match status {
        CreationStatus::Pending => '.',
        CreationStatus::Running => '*',
        CreationStatus::Committed => '+',
        CreationStatus::RolledBack => '-',
        CreationStatus::Failed => '!',
    }
}

fn target_display(task: &CreationTask) -> String {
    let target = format!("{}/{}", task.user_id, task.app_name);
    if target.chars().count() > 30 {
        let head: String = target.chars().take(27).collect();
        format!("{head}...")
    } else {
        target
    }
}
