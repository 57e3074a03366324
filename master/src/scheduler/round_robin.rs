//! Round-robin scheduler
//!
//! The safety fallback: filter candidates by resource feasibility, then hand
//! out workers by a rotating cursor over the id-sorted feasible set. Ties in
//! rotation order resolve lexically because the set is sorted before the
//! cursor applies.

use super::{feasible, Scheduler, SelectionError, TaskView, WorkerView};
use std::sync::Mutex;
use tracing::debug;

pub struct RoundRobinScheduler {
    cursor: Mutex<usize>,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(0),
        }
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn select_worker(
        &self,
        task: &TaskView,
        candidates: &[WorkerView],
    ) -> Result<String, SelectionError> {
        if candidates.is_empty() {
            return Err(SelectionError::NoCandidates);
        }

        let mut feasible_views = feasible(&task.request, candidates);
        if feasible_views.is_empty() {
            return Err(SelectionError::NoFeasibleWorker);
        }
        feasible_views.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let mut cursor = self
            .cursor
            .lock()
            .expect("round-robin cursor lock poisoned");
        let selected = feasible_views[*cursor % feasible_views.len()];
        *cursor = cursor.wrapping_add(1);

        debug!(
            task_id = %task.task_id,
            worker_id = %selected.worker_id,
            feasible = feasible_views.len(),
            "Round-robin selection"
        );
        Ok(selected.worker_id.clone())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_rotates_over_feasible_workers() {
        let scheduler = RoundRobinScheduler::new();
        let candidates = vec![view("wb", 8.0, 0.0), view("wa", 8.0, 0.0), view("wc", 8.0, 0.0)];
        let task = task_view("t1", 1.0);

        // Rotation is over the id-sorted set regardless of candidate order
        let picks: Vec<String> = (0..4)
            .map(|_| scheduler.select_worker(&task, &candidates).unwrap())
            .collect();
        assert_eq!(picks, vec!["wa", "wb", "wc", "wa"]);
    }

    #[test]
    fn test_skips_infeasible_workers() {
        let scheduler = RoundRobinScheduler::new();
        let candidates = vec![view("wa", 1.0, 0.0), view("wb", 8.0, 0.0)];
        let task = task_view("t1", 4.0);

        for _ in 0..3 {
            assert_eq!(scheduler.select_worker(&task, &candidates).unwrap(), "wb");
        }
    }

    #[test]
    fn test_errors_when_nothing_fits() {
        let scheduler = RoundRobinScheduler::new();
        let task = task_view("t1", 4.0);

        assert_eq!(
            scheduler.select_worker(&task, &[]),
            Err(SelectionError::NoCandidates)
        );
        let candidates = vec![view("wa", 1.0, 0.0)];
        assert_eq!(
            scheduler.select_worker(&task, &candidates),
            Err(SelectionError::NoFeasibleWorker)
        );
    }
}
