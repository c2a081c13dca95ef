//! Compensating actions and the stack that runs them.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use appforge_db::models::LogLevel;
use appforge_db::queries::apps;

use crate::error::CompensationFailure;
use crate::progress::{TaskLog, events};

/// A typed command that reverses one step of forward work.
///
/// Implementations must be idempotent: running one again after it already
/// succeeded, or after the thing it removes vanished, is a success.
#[async_trait]
pub trait Compensation: Send + Sync {
    /// Short human description, recorded in the task log.
    fn describe(&self) -> String;

    async fn compensate(&self) -> Result<()>;
}

/// Delete every row of the app aggregate written by the database phase.
#[derive(Debug, Clone)]
pub struct DeleteAppRecords {
    pub pool: PgPool,
    pub app_id: Uuid,
}

#[async_trait]
impl Compensation for DeleteAppRecords {
    fn describe(&self) -> String {
        format!("delete database records of app {}", self.app_id)
    }

    async fn compensate(&self) -> Result<()> {
        let removed = apps::delete_app_aggregate(&self.pool, self.app_id).await?;
        tracing::debug!(app_id = %self.app_id, removed, "deleted app records");
        Ok(())
    }
}

/// Recursively delete a directory the local-file phase created.
#[derive(Debug, Clone)]
pub struct RemoveDirectory {
    pub path: PathBuf,
}

#[async_trait]
impl Compensation for RemoveDirectory {
    fn describe(&self) -> String {
        format!("remove directory {}", self.path.display())
    }

    async fn compensate(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

/// Remove exactly the files and directories the resource phase created.
///
/// Files go first, then directories in reverse creation order so nested
/// ones are removed before their parents.
#[derive(Debug, Clone, Default)]
pub struct RemoveResourceFiles {
    pub files: Vec<PathBuf>,
    pub dirs: Vec<PathBuf>,
}

#[async_trait]
impl Compensation for RemoveResourceFiles {
    fn describe(&self) -> String {
        format!(
            "remove {} resource file(s) and {} director(ies)",
            self.files.len(),
            self.dirs.len()
        )
    }

    async fn compensate(&self) -> Result<()> {
        for file in &self.files {
            match tokio::fs::remove_file(file).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to remove {}", file.display()));
                }
            }
        }
        for dir in self.dirs.iter().rev() {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to remove {}", dir.display()));
                }
            }
        }
        Ok(())
    }
}

/// Outcome of unwinding a [`CompensationStack`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Descriptions of compensations that succeeded, in execution order.
    pub succeeded: Vec<String>,
    pub failures: Vec<CompensationFailure>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }
}

/// LIFO stack of compensations registered during forward progress.
#[derive(Default)]
pub struct CompensationStack {
    entries: Vec<Box<dyn Compensation>>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, compensation: Box<dyn Compensation>) {
        self.entries.push(compensation);
    }

    pub fn extend(&mut self, compensations: impl IntoIterator<Item = Box<dyn Compensation>>) {
        self.entries.extend(compensations);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry. Called once the task commits.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Descriptions from top of stack to bottom, i.e. unwind order.
    pub fn descriptions(&self) -> Vec<String> {
        self.entries.iter().rev().map(|c| c.describe()).collect()
    }

    /// Pop and run every compensation, newest first.
    ///
    /// A failing step does not stop the sweep. Each step is bounded by
    /// `step_timeout` and logs one entry with its result; failures are
    /// logged at `critical`.
    pub async fn unwind(
        &mut self,
        task_id: Uuid,
        log: &TaskLog,
        step_timeout: Duration,
    ) -> RollbackReport {
        let mut report = RollbackReport::default();

        while let Some(compensation) = self.entries.pop() {
            let description = compensation.describe();
            let outcome = match tokio::time::timeout(step_timeout, compensation.compensate()).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(_) => Err(format!(
                    "timed out after {}ms",
                    step_timeout.as_millis()
                )),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(task_id = %task_id, step = %description, "compensation succeeded");
                    log.append(
                        task_id,
                        LogLevel::Info,
                        format!("compensated: {description}"),
                        json!({
                            "event": events::COMPENSATION,
                            "step": description,
                            "result": "ok",
                        }),
                    )
                    .await;
                    report.succeeded.push(description);
                }
                Err(error) => {
                    tracing::error!(
                        task_id = %task_id,
                        step = %description,
                        error = %error,
                        "compensation failed"
                    );
                    log.append(
                        task_id,
                        LogLevel::Critical,
                        format!("compensation failed: {description}: {error}"),
                        json!({
                            "event": events::COMPENSATION,
                            "step": description,
                            "result": "failed",
                            "error": error,
                        }),
                    )
                    .await;
                    report.failures.push(CompensationFailure { description, error });
                }
            }
        }

        report
    }
}
