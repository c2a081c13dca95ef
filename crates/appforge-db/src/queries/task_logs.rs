//! Database query functions for the append-only `task_logs` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{LogLevel, TaskLogEntry};

/// Parameters for appending a log entry.
#[derive(Debug, Clone)]
pub struct NewTaskLogEntry {
    pub task_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub payload: Value,
}

/// Append an entry to a task's log.
///
/// The sequence number is assigned here as one past the task's current
/// maximum, so entries for one task are numbered 1, 2, 3, ... in append
/// order. The `(task_id, seq)` unique constraint rejects a concurrent
/// writer that computed the same number.
pub async fn append_task_log(pool: &PgPool, new: &NewTaskLogEntry) -> Result<TaskLogEntry> {
    let entry = sqlx::query_as::<_, TaskLogEntry>(
        "INSERT INTO task_logs (task_id, seq, level, message, payload) \
         SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4 \
         FROM task_logs WHERE task_id = $1 \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.level)
    .bind(&new.message)
    .bind(&new.payload)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to append log entry for task {}", new.task_id))?;

    Ok(entry)
}

/// List a task's log entries in sequence order, optionally only those after
/// `after_seq`. Used by reconnecting subscribers to replay what they missed.
pub async fn list_task_logs(
    pool: &PgPool,
    task_id: Uuid,
    after_seq: Option<i64>,
) -> Result<Vec<TaskLogEntry>> {
    let entries = sqlx::query_as::<_, TaskLogEntry>(
        "SELECT * FROM task_logs \
         WHERE task_id = $1 AND seq > $2 \
         ORDER BY seq ASC",
    )
    .bind(task_id)
    .bind(after_seq.unwrap_or(0))
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list log entries for task {task_id}"))?;

    Ok(entries)
}

/// Count a task's log entries with the given level.
pub async fn count_task_logs_at_level(
    pool: &PgPool,
    task_id: Uuid,
    level: LogLevel,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_logs WHERE task_id = $1 AND level = $2",
    )
    .bind(task_id)
    .bind(level)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to count {level} log entries for task {task_id}"))?;

    Ok(row.0)
}
