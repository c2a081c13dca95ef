//! `appforge log` command: replay a creation task's log from the database.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use appforge_db::models::{LogLevel, TaskLogEntry};
use appforge_db::queries::creation_tasks as task_db;
use appforge_db::queries::task_logs;

/// Run the log command.
pub async fn run_log(pool: &PgPool, task_id_str: &str, after: Option<i64>) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_creation_task(pool, task_id)
        .await?
        .with_context(|| format!("creation task {task_id} not found"))?;

    println!("Task: {}/{} ({})", task.user_id, task.app_name, task.id);
    println!("Status: {} (phase {})", task.status, task.current_phase);
    println!();

    let entries = task_logs::list_task_logs(pool, task_id, after).await?;
    if entries.is_empty() {
        println!("No log entries recorded.");
        return Ok(());
    }

    println!("Entries ({}):", entries.len());
    for entry in &entries {
        println!("  {}", format_entry(entry));
    }

    Ok(())
}

/// One-line rendering of a log entry, shared with `appforge create`.
pub fn format_entry(entry: &TaskLogEntry) -> String {
    let time = entry.logged_at.format("%H:%M:%S%.3f");
    let marker = match entry.level {
        LogLevel::Critical => "!!",
        LogLevel::Error => "! ",
        LogLevel::Warn => "? ",
        LogLevel::Info | LogLevel::Debug => "  ",
    };
    let event = entry.payload["event"].as_str().unwrap_or("-");
    format!(
        "[{time}] #{:<3} {marker}{:<8} {:<20} {}",
        entry.seq,
        entry.level.to_string(),
        event,
        entry.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(level: LogLevel, payload: serde_json::Value) -> TaskLogEntry {
        TaskLogEntry {
            id: 1,
            task_id: Uuid::nil(),
            seq: 4,
            level,
            message: "remove directory /tmp/x".into(),
            payload,
            logged_at: Utc::now(),
        }
    }

    #[test]
    fn critical_entries_stand_out() {
        let line = format_entry(&entry(
            LogLevel::Critical,
            serde_json::json!({ "event": "compensation" }),
        ));
        assert!(line.contains("#4"));
        assert!(line.contains("!!critical"));
        assert!(line.contains("compensation"));
        assert!(line.ends_with("remove directory /tmp/x"));
    }

    #[test]
    fn missing_event_is_rendered_as_dash() {
        let line = format_entry(&entry(LogLevel::Info, serde_json::json!({})));
        assert!(line.contains(" - "), "{line}");
    }
}
