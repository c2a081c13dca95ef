//! Task progress: the durable per-task log and its live broadcast.
//!
//! Every entry is persisted through a [`TaskLogSink`] first and only then
//! handed to the [`ProgressBroadcaster`]. Appending never fails from the
//! caller's side: a sink error is traced and the provisioning work carries
//! on.

pub mod broadcast;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::broadcast::Receiver;
use uuid::Uuid;

use appforge_db::models::{LogLevel, TaskLogEntry};
use appforge_db::queries::task_logs::{self, NewTaskLogEntry};

pub use broadcast::{ProgressBroadcaster, topic};

/// Values of the `event` field in log entry payloads.
pub mod events {
    pub const TASK_CREATED: &str = "task_created";
    pub const TASK_STARTED: &str = "task_started";
    pub const PHASE_STARTED: &str = "phase_started";
    pub const PHASE_PROGRESS: &str = "phase_progress";
    pub const PHASE_SUCCEEDED: &str = "phase_succeeded";
    pub const PHASE_FAILED: &str = "phase_failed";
    pub const ROLLBACK_STARTED: &str = "rollback_started";
    pub const COMPENSATION: &str = "compensation";
    pub const ROLLBACK_COMPLETE: &str = "rollback_complete";
    pub const ROLLBACK_INCOMPLETE: &str = "rollback_incomplete";
    pub const TASK_COMMITTED: &str = "task_committed";
}

/// Durable, ordered, append-only storage for task log entries.
#[async_trait]
pub trait TaskLogSink: Send + Sync {
    /// Persist an entry, assigning the next sequence number for its task.
    async fn append(&self, entry: NewTaskLogEntry) -> Result<TaskLogEntry>;

    /// Read a task's entries in sequence order, after `after_seq` if given.
    async fn read(&self, task_id: Uuid, after_seq: Option<i64>) -> Result<Vec<TaskLogEntry>>;
}

/// [`TaskLogSink`] backed by the `task_logs` table.
#[derive(Debug, Clone)]
pub struct PgTaskLogSink {
    pool: PgPool,
}

impl PgTaskLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskLogSink for PgTaskLogSink {
    async fn append(&self, entry: NewTaskLogEntry) -> Result<TaskLogEntry> {
        task_logs::append_task_log(&self.pool, &entry).await
    }

    async fn read(&self, task_id: Uuid, after_seq: Option<i64>) -> Result<Vec<TaskLogEntry>> {
        task_logs::list_task_logs(&self.pool, task_id, after_seq).await
    }
}

/// Facade the orchestrator and phases log through: persist, then broadcast.
#[derive(Clone)]
pub struct TaskLog {
    sink: Arc<dyn TaskLogSink>,
    broadcaster: ProgressBroadcaster,
}

impl TaskLog {
    pub fn new(sink: Arc<dyn TaskLogSink>, broadcaster: ProgressBroadcaster) -> Self {
        Self { sink, broadcaster }
    }

    /// A log persisted to PostgreSQL with a fresh broadcaster.
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Arc::new(PgTaskLogSink::new(pool)), ProgressBroadcaster::new())
    }

    /// Append an entry and broadcast it.
    ///
    /// Returns the stored entry, or `None` if the sink rejected it. The
    /// failure is traced, never propagated.
    pub async fn append(
        &self,
        task_id: Uuid,
        level: LogLevel,
        message: impl Into<String>,
        payload: Value,
    ) -> Option<TaskLogEntry> {
        let new = NewTaskLogEntry {
            task_id,
            level,
            message: message.into(),
            payload,
        };

        match self.sink.append(new).await {
            Ok(entry) => {
                tracing::debug!(
                    task_id = %task_id,
                    seq = entry.seq,
                    level = %entry.level,
                    "{}",
                    entry.message
                );
                self.broadcaster.broadcast(&entry);
                Some(entry)
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    error = %format!("{e:#}"),
                    "failed to persist task log entry"
                );
                None
            }
        }
    }

    /// Re-read persisted entries, e.g. for a reconnecting subscriber.
    pub async fn replay(&self, task_id: Uuid, after_seq: Option<i64>) -> Result<Vec<TaskLogEntry>> {
        self.sink.read(task_id, after_seq).await
    }

    pub fn subscribe(&self, task_id: Uuid) -> Receiver<TaskLogEntry> {
        self.broadcaster.subscribe(task_id)
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    /// Mark the task's stream finished; live subscribers see it end.
    pub fn finish(&self, task_id: Uuid) {
        self.broadcaster.close(task_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;

    /// In-process sink for unit tests.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        entries: Mutex<Vec<TaskLogEntry>>,
    }

    impl MemorySink {
        pub(crate) fn entries(&self) -> Vec<TaskLogEntry> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskLogSink for MemorySink {
        async fn append(&self, new: NewTaskLogEntry) -> Result<TaskLogEntry> {
            let mut entries = self.entries.lock().unwrap();
            let seq = entries.iter().filter(|e| e.task_id == new.task_id).count() as i64 + 1;
            let entry = TaskLogEntry {
                id: entries.len() as i64 + 1,
                task_id: new.task_id,
                seq,
                level: new.level,
                message: new.message,
                payload: new.payload,
                logged_at: Utc::now(),
            };
            entries.push(entry.clone());
            Ok(entry)
        }

        async fn read(&self, task_id: Uuid, after_seq: Option<i64>) -> Result<Vec<TaskLogEntry>> {
            let after = after_seq.unwrap_or(0);
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.task_id == task_id && e.seq > after)
                .cloned()
                .collect())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl TaskLogSink for BrokenSink {
        async fn append(&self, _new: NewTaskLogEntry) -> Result<TaskLogEntry> {
            anyhow::bail!("disk full")
        }

        async fn read(&self, _task_id: Uuid, _after_seq: Option<i64>) -> Result<Vec<TaskLogEntry>> {
            anyhow::bail!("disk full")
        }
    }

    pub(crate) fn memory_log() -> (TaskLog, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let log = TaskLog::new(sink.clone(), ProgressBroadcaster::new());
        (log, sink)
    }

    #[tokio::test]
    async fn entries_are_persisted_then_broadcast() {
        let (log, sink) = memory_log();
        let task = Uuid::new_v4();
        let mut rx = log.subscribe(task);

        let stored = log
            .append(task, LogLevel::Info, "hello", serde_json::json!({"event": "x"}))
            .await
            .expect("memory sink accepts entries");

        assert_eq!(stored.seq, 1);
        assert_eq!(sink.entries().len(), 1);
        assert_eq!(rx.recv().await.unwrap(), stored);
    }

    #[tokio::test]
    async fn sequence_numbers_are_per_task() {
        let (log, _sink) = memory_log();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        log.append(a, LogLevel::Info, "a1", Value::Null).await;
        log.append(b, LogLevel::Info, "b1", Value::Null).await;
        let a2 = log.append(a, LogLevel::Info, "a2", Value::Null).await.unwrap();

        assert_eq!(a2.seq, 2);
        let replayed: Vec<i64> = log.replay(a, None).await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(replayed, vec![1, 2]);
        assert_eq!(log.replay(a, Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed_and_not_broadcast() {
        let log = TaskLog::new(Arc::new(BrokenSink), ProgressBroadcaster::new());
        let task = Uuid::new_v4();
        let mut rx = log.subscribe(task);

        let stored = log.append(task, LogLevel::Error, "lost", Value::Null).await;
        assert!(stored.is_none());

        log.finish(task);
        assert!(rx.recv().await.is_err());
    }
}
