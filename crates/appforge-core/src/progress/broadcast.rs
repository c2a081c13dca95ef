//! Best-effort fan-out of task log entries to live subscribers.
//!
//! Each task has one logical topic, `build-logs/{task_id}`. Delivery is not
//! guaranteed: a slow subscriber may lag and lose entries, and one that
//! connects late sees only what is published afterwards. Missed entries are
//! recovered by re-reading the sink, never from here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use appforge_db::models::TaskLogEntry;

/// Per-topic buffer before lagging subscribers start losing entries.
const CHANNEL_CAPACITY: usize = 256;

/// Topic name for a task's progress stream.
pub fn topic(task_id: Uuid) -> String {
    format!("build-logs/{task_id}")
}

/// Registry of per-task broadcast channels.
#[derive(Debug, Clone, Default)]
pub struct ProgressBroadcaster {
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<TaskLogEntry>>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a task's topic, creating it if needed.
    pub fn subscribe(&self, task_id: Uuid) -> broadcast::Receiver<TaskLogEntry> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Push an entry to the task's current subscribers.
    ///
    /// Returns how many subscribers received it. Topics without subscribers
    /// drop the entry.
    pub fn broadcast(&self, entry: &TaskLogEntry) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match channels.get(&entry.task_id) {
            Some(tx) => tx.send(entry.clone()).unwrap_or(0),
            None => 0,
        }
    }

    /// Close a task's topic. Subscribers drain what is buffered and then see
    /// the stream end.
    pub fn close(&self, task_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(&task_id);
    }

    pub fn subscriber_count(&self, task_id: Uuid) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(&task_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_db::models::LogLevel;
    use chrono::Utc;
    use tokio::sync::broadcast::error::RecvError;

    fn entry(task_id: Uuid, seq: i64) -> TaskLogEntry {
        TaskLogEntry {
            id: seq,
            task_id,
            seq,
            level: LogLevel::Info,
            message: format!("entry {seq}"),
            payload: serde_json::json!({}),
            logged_at: Utc::now(),
        }
    }

    #[test]
    fn topic_is_keyed_by_task_id() {
        let id = Uuid::nil();
        assert_eq!(topic(id), "build-logs/00000000-0000-0000-0000-000000000000");
    }

    #[tokio::test]
    async fn subscribers_receive_entries_in_order() {
        let b = ProgressBroadcaster::new();
        let task = Uuid::new_v4();
        let mut rx = b.subscribe(task);

        assert_eq!(b.broadcast(&entry(task, 1)), 1);
        assert_eq!(b.broadcast(&entry(task, 2)), 1);

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn entries_for_other_tasks_are_not_delivered() {
        let b = ProgressBroadcaster::new();
        let mine = Uuid::new_v4();
        let mut rx = b.subscribe(mine);

        assert_eq!(b.broadcast(&entry(Uuid::new_v4(), 1)), 0);
        b.broadcast(&entry(mine, 7));
        assert_eq!(rx.recv().await.unwrap().seq, 7);
    }

    #[test]
    fn broadcast_without_subscribers_is_dropped() {
        let b = ProgressBroadcaster::new();
        assert_eq!(b.broadcast(&entry(Uuid::new_v4(), 1)), 0);
    }

    #[tokio::test]
    async fn close_ends_the_stream_after_buffered_entries() {
        let b = ProgressBroadcaster::new();
        let task = Uuid::new_v4();
        let mut rx = b.subscribe(task);

        b.broadcast(&entry(task, 1));
        b.close(task);

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert_eq!(b.subscriber_count(task), 0);
    }
}
