//! Pending task queue for the master
//!
//! A FIFO of admitted tasks awaiting placement. Entries keep their arrival
//! order; an infeasible entry can be skipped by the assignment engine without
//! reordering anything. Each entry carries a retry counter and the last
//! placement error for operator visibility.

use shared::task::Task;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::debug;

/// One queued task awaiting placement
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub task: Task,
    pub queued_at: u64,
    pub retries: u32,
    pub last_error: Option<String>,
}

/// FIFO of admitted tasks
pub struct TaskQueue {
    entries: Mutex<VecDeque<QueuedEntry>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a task. Returns its zero-based queue position.
    pub async fn enqueue(&self, task: Task) -> usize {
        let mut entries = self.entries.lock().await;
        entries.push_back(QueuedEntry {
            task,
            queued_at: shared::utils::current_timestamp(),
            retries: 0,
            last_error: None,
        });
        entries.len() - 1
    }

    /// Ordered copy of the queue
    pub async fn snapshot(&self) -> Vec<QueuedEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Remove and return the head entry
    pub async fn take(&self) -> Option<QueuedEntry> {
        self.entries.lock().await.pop_front()
    }

    /// Re-append an entry after a failed placement, bumping its retry count
    pub async fn requeue(&self, mut entry: QueuedEntry, error: &str) {
        entry.retries += 1;
        entry.last_error = Some(error.to_string());
        debug!(
            task_id = %entry.task.task_id,
            retries = entry.retries,
            error = %error,
            "Task returned to queue"
        );
        self.entries.lock().await.push_back(entry);
    }

    /// Record a failed placement attempt in place, preserving queue order
    pub async fn mark_failed_attempt(&self, task_id: &str, error: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.task.task_id == task_id) {
            entry.retries += 1;
            entry.last_error = Some(error.to_string());
        }
    }

    /// Remove a specific task. Returns the entry when it was still queued.
    pub async fn remove(&self, task_id: &str) -> Option<QueuedEntry> {
        let mut entries = self.entries.lock().await;
        let index = entries.iter().position(|e| e.task.task_id == task_id)?;
        entries.remove(index)
    }

    /// Zero-based position of a task in the queue
    pub async fn position(&self, task_id: &str) -> Option<usize> {
        self.entries
            .lock()
            .await
            .iter()
            .position(|e| e.task.task_id == task_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::task::{ResourceRequest, TaskStatus, TaskType};

    fn task(task_id: &str) -> Task {
        Task {
            task_id: task_id.to_string(),
            user_id: "alice".to_string(),
            task_name: task_id.to_string(),
            image: "hello-world".to_string(),
            command: vec![],
            request: ResourceRequest::new(1.0, 512.0, 0.0, 0.0),
            task_type: TaskType::CpuLight,
            tau_seconds: None,
            sla_multiplier: 2.0,
            submitted_at: 0,
            status: TaskStatus::Queued,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty().await);
        assert_eq!(queue.enqueue(task("t1")).await, 0);
        assert_eq!(queue.enqueue(task("t2")).await, 1);
        assert_eq!(queue.enqueue(task("t3")).await, 2);

        assert_eq!(queue.take().await.unwrap().task.task_id, "t1");
        assert_eq!(queue.take().await.unwrap().task.task_id, "t2");
        assert_eq!(queue.take().await.unwrap().task.task_id, "t3");
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_tracks_retries_and_error() {
        let queue = TaskQueue::new();
        queue.enqueue(task("t1")).await;

        let entry = queue.take().await.unwrap();
        assert_eq!(entry.retries, 0);
        queue.requeue(entry, "no feasible worker").await;

        let entry = queue.take().await.unwrap();
        assert_eq!(entry.retries, 1);
        assert_eq!(entry.last_error.as_deref(), Some("no feasible worker"));
    }

    #[tokio::test]
    async fn test_mark_failed_attempt_keeps_order() {
        let queue = TaskQueue::new();
        queue.enqueue(task("t1")).await;
        queue.enqueue(task("t2")).await;
        queue.enqueue(task("t3")).await;

        // Marking a middle entry failed must not reorder the queue
        queue.mark_failed_attempt("t2", "infeasible").await;

        let snapshot = queue.snapshot().await;
        let ids: Vec<&str> = snapshot.iter().map(|e| e.task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert_eq!(snapshot[1].retries, 1);
        assert_eq!(snapshot[1].last_error.as_deref(), Some("infeasible"));
        assert_eq!(snapshot[0].retries, 0);
    }

    #[tokio::test]
    async fn test_remove_and_position() {
        let queue = TaskQueue::new();
        queue.enqueue(task("t1")).await;
        queue.enqueue(task("t2")).await;
        queue.enqueue(task("t3")).await;

        assert_eq!(queue.position("t2").await, Some(1));
        let removed = queue.remove("t2").await.unwrap();
        assert_eq!(removed.task.task_id, "t2");
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.position("t2").await, None);
        assert_eq!(queue.position("t3").await, Some(1));
        assert!(queue.remove("t2").await.is_none());
    }
}
