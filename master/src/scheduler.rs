//! Scheduler interface for worker selection
//!
//! Placement strategy sits behind a single-method trait so the assignment
//! engine is indifferent to how a worker is chosen. Implementations are
//! stateless across calls apart from strategy-local state such as the
//! round-robin cursor, and must only ever return a worker from the candidate
//! slice they were given.

pub mod round_robin;
pub mod rts;

pub use crate::registry::WorkerView;

use shared::task::{ResourceRequest, Task, TaskType};

/// The task fields a scheduler sees
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task_id: String,
    pub task_type: TaskType,
    pub request: ResourceRequest,
    pub tau_seconds: Option<f64>,
    /// Absolute SLA deadline, when the task has one
    pub deadline: Option<u64>,
    /// Time the selection is being made (Unix seconds); predicted finish
    /// times are measured from here
    pub arrival: u64,
}

impl TaskView {
    pub fn from_task(task: &Task, now: u64) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type,
            request: task.request,
            tau_seconds: task.tau_seconds,
            deadline: task.deadline(),
            arrival: now,
        }
    }
}

/// Why no worker was selected
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SelectionError {
    #[error("no active workers")]
    NoCandidates,
    #[error("no feasible worker for task")]
    NoFeasibleWorker,
    #[error("scheduler produced a non-finite score")]
    InvalidScore,
}

/// Pluggable placement strategy
pub trait Scheduler: Send + Sync {
    /// Pick a worker for the task from the given candidates
    fn select_worker(
        &self,
        task: &TaskView,
        candidates: &[WorkerView],
    ) -> Result<String, SelectionError>;

    /// Short strategy name for logs
    fn name(&self) -> &'static str;
}

/// Workers with enough headroom for the request, preserving candidate order
pub fn feasible<'a>(request: &ResourceRequest, candidates: &'a [WorkerView]) -> Vec<&'a WorkerView> {
    candidates
        .iter()
        .filter(|view| request.fits_within(&view.available))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_feasible_filters_and_preserves_order() {
        let candidates = vec![view("wa", 1.0, 0.0), view("wb", 4.0, 0.0), view("wc", 2.0, 0.0)];
        let task = task_view("t1", 2.0);

        let feasible = feasible(&task.request, &candidates);
        let ids: Vec<&str> = feasible.iter().map(|v| v.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["wb", "wc"]);
    }

    #[test]
    fn test_feasible_admits_exact_fit() {
        let candidates = vec![view("wa", 2.0, 0.0)];
        let task = task_view("t1", 2.0);
        assert_eq!(feasible(&task.request, &candidates).len(), 1);
    }
}
