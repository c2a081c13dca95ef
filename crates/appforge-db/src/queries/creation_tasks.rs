//! Database query functions for the `creation_tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreationStatus, CreationTask};

/// Insert a new creation task in `pending` status.
///
/// Fails when a task with the same id already exists: task ids are unique
/// per attempt.
pub async fn insert_creation_task(
    pool: &PgPool,
    id: Uuid,
    user_id: &str,
    app_name: &str,
    request: &Value,
) -> Result<CreationTask> {
    let task = sqlx::query_as::<_, CreationTask>(
        "INSERT INTO creation_tasks (id, user_id, app_name, request) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(id)
    .bind(user_id)
    .bind(app_name)
    .bind(request)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert creation task {id}"))?;

    Ok(task)
}

/// Fetch a single creation task by ID.
pub async fn get_creation_task(pool: &PgPool, id: Uuid) -> Result<Option<CreationTask>> {
    let task = sqlx::query_as::<_, CreationTask>("SELECT * FROM creation_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch creation task")?;

    Ok(task)
}

/// List the most recent creation tasks, newest first.
pub async fn list_creation_tasks(pool: &PgPool, limit: i64) -> Result<Vec<CreationTask>> {
    let tasks = sqlx::query_as::<_, CreationTask>(
        "SELECT * FROM creation_tasks ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list creation tasks")?;

    Ok(tasks)
}

/// List every creation task that targeted `(user_id, app_name)`, oldest
/// first.
pub async fn list_tasks_for_target(
    pool: &PgPool,
    user_id: &str,
    app_name: &str,
) -> Result<Vec<CreationTask>> {
    let tasks = sqlx::query_as::<_, CreationTask>(
        "SELECT * FROM creation_tasks \
         WHERE user_id = $1 AND app_name = $2 \
         ORDER BY created_at ASC",
    )
    .bind(user_id)
    .bind(app_name)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list creation tasks for {user_id}/{app_name}"))?;

    Ok(tasks)
}

/// Atomically transition a creation task from one status to another.
///
/// Uses optimistic locking: the UPDATE only matches when the current status
/// equals `from`. Returns the number of rows affected (0 means the status did
/// not match or the task does not exist).
pub async fn transition_creation_status(
    pool: &PgPool,
    id: Uuid,
    from: CreationStatus,
    to: CreationStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE creation_tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             error = COALESCE($4, error) \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(error)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition creation task status")?;

    Ok(result.rows_affected())
}

/// Record which phase a running task is executing.
///
/// Only applies while the task is `running`; returns rows affected.
pub async fn set_current_phase(pool: &PgPool, id: Uuid, phase: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE creation_tasks SET current_phase = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(phase)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to set current phase of creation task {id}"))?;

    Ok(result.rows_affected())
}

/// Record the app id produced by the database phase.
pub async fn set_app_id(pool: &PgPool, id: Uuid, app_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE creation_tasks SET app_id = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(app_id)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to set app id of creation task {id}"))?;

    Ok(result.rows_affected())
}
