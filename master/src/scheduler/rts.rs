//! Risk-aware task scheduler
//!
//! Scores every feasible worker with a multi-factor risk value: predicted
//! execution time under the current coefficient set, slack against the SLA
//! deadline, normalized load, per-type affinity, and per-worker penalty. The
//! lowest final risk wins. Any non-finite score, or an empty feasible set,
//! abandons the pass entirely and delegates to the round-robin fallback.
//!
//! The parameter bundle behind the scoring is re-read from its file on a
//! fixed interval and swapped atomically behind a reader/writer lock, so a
//! selection that started with one bundle finishes with that bundle.

use super::round_robin::RoundRobinScheduler;
use super::{feasible, Scheduler, SelectionError, TaskView, WorkerView};
use shared::params::ParameterBundle;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Floor applied to availability divisors so a zero-headroom resource cannot
/// blow the prediction up to infinity
const EPSILON: f64 = 1e-6;

pub struct RtsScheduler {
    params: RwLock<ParameterBundle>,
    param_path: PathBuf,
    fallback: RoundRobinScheduler,
    /// Selections delegated to the fallback since startup
    fallback_count: AtomicU64,
}

impl RtsScheduler {
    /// Create the scheduler, loading the parameter file when one is already
    /// present. A missing or malformed file leaves the defaults in place.
    pub fn new(param_path: PathBuf) -> Arc<Self> {
        let params = match ParameterBundle::load(&param_path) {
            Ok(bundle) => {
                info!(
                    path = %param_path.display(),
                    generated_at = bundle.generated_at,
                    "Loaded scheduler parameters"
                );
                bundle
            }
            Err(_) => {
                debug!(
                    path = %param_path.display(),
                    "No usable parameter file, starting with defaults"
                );
                ParameterBundle::default()
            }
        };

        Arc::new(Self {
            params: RwLock::new(params),
            param_path,
            fallback: RoundRobinScheduler::new(),
            fallback_count: AtomicU64::new(0),
        })
    }

    /// Current bundle (cloned out from under the lock)
    pub fn current_params(&self) -> ParameterBundle {
        self.params
            .read()
            .expect("parameter lock poisoned")
            .clone()
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    /// Re-read the parameter file once, swapping the bundle in when it is
    /// valid and newer than the current one. Malformed files are rejected and
    /// the last good bundle is retained.
    pub fn refresh_once(&self) {
        match ParameterBundle::load(&self.param_path) {
            Ok(bundle) => {
                let mut current = self.params.write().expect("parameter lock poisoned");
                if *current != bundle {
                    info!(
                        generated_at = bundle.generated_at,
                        "Scheduler parameters updated"
                    );
                    *current = bundle;
                }
            }
            Err(e) => {
                if self.param_path.exists() {
                    warn!(
                        path = %self.param_path.display(),
                        error = %e,
                        "Rejected parameter file, keeping previous bundle"
                    );
                } else {
                    debug!(path = %self.param_path.display(), "Parameter file not present");
                }
            }
        }
    }

    /// Background refresher: polls the parameter file until shutdown.
    pub async fn run_refresher(
        self: Arc<Self>,
        interval_seconds: u64,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh_once();
                }
                _ = shutdown_rx.recv() => {
                    info!("Parameter refresher received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Predicted execution time of the task on a worker under the bundle
    fn predict_runtime(params: &ParameterBundle, task: &TaskView, worker: &WorkerView) -> f64 {
        let Some(tau) = task.tau_seconds else {
            return 0.0;
        };
        let avail = &worker.available;
        tau * (1.0
            + params.theta[0] * task.request.cpu / avail.cpu.max(EPSILON)
            + params.theta[1] * task.request.mem_mb / avail.mem_mb.max(EPSILON)
            + params.theta[2] * task.request.gpu / avail.gpu.max(EPSILON)
            + params.theta[3] * worker.load)
    }

    /// Final risk of placing the task on a worker
    fn risk(params: &ParameterBundle, task: &TaskView, worker: &WorkerView) -> f64 {
        let predicted = Self::predict_runtime(params, task, worker);
        let slack_violation = match task.deadline {
            Some(deadline) => {
                let finish = task.arrival as f64 + predicted;
                (finish - deadline as f64).max(0.0)
            }
            None => 0.0,
        };
        let base = params.alpha * slack_violation + params.beta * worker.load;
        base - params.affinity_for(task.task_type.as_str(), &worker.worker_id)
            + params.penalty_for(&worker.worker_id)
    }

    fn fall_back(
        &self,
        task: &TaskView,
        candidates: &[WorkerView],
        reason: &str,
    ) -> Result<String, SelectionError> {
        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            task_id = %task.task_id,
            reason = %reason,
            "Risk scheduler fell back to round-robin"
        );
        self.fallback.select_worker(task, candidates)
    }
}

impl Scheduler for RtsScheduler {
    fn select_worker(
        &self,
        task: &TaskView,
        candidates: &[WorkerView],
    ) -> Result<String, SelectionError> {
        if candidates.is_empty() {
            return Err(SelectionError::NoCandidates);
        }

        let feasible_views = feasible(&task.request, candidates);
        if feasible_views.is_empty() {
            return self.fall_back(task, candidates, "empty feasible set");
        }

        // All scores for one selection come from a single bundle; the swap in
        // refresh_once can never tear a computation.
        let params = self.params.read().expect("parameter lock poisoned");

        let mut best: Option<(&WorkerView, f64)> = None;
        for view in feasible_views {
            let risk = Self::risk(&params, task, view);
            if !risk.is_finite() {
                drop(params);
                return self.fall_back(task, candidates, "non-finite risk score");
            }
            debug!(
                task_id = %task.task_id,
                worker_id = %view.worker_id,
                risk = risk,
                load = view.load,
                "Scored candidate"
            );
            best = match best {
                None => Some((view, risk)),
                Some((best_view, best_risk)) => {
                    // Lower risk wins; ties break to the less loaded worker,
                    // then to lexical id order.
                    let better = risk < best_risk
                        || (risk == best_risk && view.load < best_view.load)
                        || (risk == best_risk
                            && view.load == best_view.load
                            && view.worker_id < best_view.worker_id);
                    if better {
                        Some((view, risk))
                    } else {
                        Some((best_view, best_risk))
                    }
                }
            };
        }

        let (selected, risk) = best.expect("feasible set was checked non-empty");
        debug!(
            task_id = %task.task_id,
            worker_id = %selected.worker_id,
            risk = risk,
            "Risk scheduler selection"
        );
        Ok(selected.worker_id.clone())
    }

    fn name(&self) -> &'static str {
        "rts"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use shared::task::{ResourceRequest, TaskType};
    use tempfile::TempDir;

    fn scheduler_with(bundle: ParameterBundle) -> (Arc<RtsScheduler>, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        bundle.save(&path).unwrap();
        (RtsScheduler::new(path), dir)
    }

    fn gpu_task(task_id: &str) -> TaskView {
        TaskView {
            task_id: task_id.to_string(),
            task_type: TaskType::GpuHeavy,
            request: ResourceRequest::new(1.0, 1_024.0, 0.0, 1.0),
            tau_seconds: Some(60.0),
            deadline: Some(1_200),
            arrival: 1_000,
        }
    }

    #[test]
    fn test_affinity_attracts_selection() {
        let mut bundle = ParameterBundle::default();
        bundle
            .affinity
            .entry("gpu-heavy".to_string())
            .or_default()
            .insert("wb".to_string(), 4.0);
        let (scheduler, _dir) = scheduler_with(bundle);

        // All else equal between wa and wb
        let candidates = vec![view("wa", 8.0, 0.1), view("wb", 8.0, 0.1)];
        let picked = scheduler.select_worker(&gpu_task("t4"), &candidates).unwrap();
        assert_eq!(picked, "wb");
        assert_eq!(scheduler.fallback_count(), 0);
    }

    #[test]
    fn test_penalty_repels_selection() {
        let mut bundle = ParameterBundle::default();
        bundle
            .affinity
            .entry("gpu-heavy".to_string())
            .or_default()
            .insert("wb".to_string(), 4.0);
        bundle.penalty.insert("wb".to_string(), 10.0);
        let (scheduler, _dir) = scheduler_with(bundle);

        // The penalty outweighs the affinity advantage
        let candidates = vec![view("wa", 8.0, 0.1), view("wb", 8.0, 0.1)];
        let picked = scheduler.select_worker(&gpu_task("t5"), &candidates).unwrap();
        assert_eq!(picked, "wa");
    }

    #[test]
    fn test_load_weight_prefers_idle_worker() {
        let (scheduler, _dir) = scheduler_with(ParameterBundle::default());
        let candidates = vec![view("wa", 8.0, 0.8), view("wb", 8.0, 0.1)];
        let picked = scheduler.select_worker(&gpu_task("t1"), &candidates).unwrap();
        assert_eq!(picked, "wb");
    }

    #[test]
    fn test_tie_breaks_to_lexical_order() {
        let (scheduler, _dir) = scheduler_with(ParameterBundle::default());
        // Identical availability and load: risks are exactly equal
        let candidates = vec![view("wb", 8.0, 0.3), view("wa", 8.0, 0.3)];
        let picked = scheduler.select_worker(&gpu_task("t1"), &candidates).unwrap();
        assert_eq!(picked, "wa");
    }

    #[test]
    fn test_empty_feasible_set_falls_back() {
        let (scheduler, _dir) = scheduler_with(ParameterBundle::default());
        let task = TaskView {
            request: ResourceRequest::new(64.0, 0.0, 0.0, 0.0),
            ..gpu_task("t1")
        };
        let candidates = vec![view("wa", 8.0, 0.1)];
        // Fallback also finds nothing feasible and fails cleanly
        assert_eq!(
            scheduler.select_worker(&task, &candidates),
            Err(SelectionError::NoFeasibleWorker)
        );
        assert_eq!(scheduler.fallback_count(), 1);

        assert_eq!(
            scheduler.select_worker(&task, &[]),
            Err(SelectionError::NoCandidates)
        );
    }

    #[test]
    fn test_zero_availability_does_not_blow_up() {
        let (scheduler, _dir) = scheduler_with(ParameterBundle::default());
        // GPU availability zero while the task requests none: the epsilon
        // floor keeps the unused ratio term finite.
        let mut wa = view("wa", 8.0, 0.1);
        wa.available.gpu = 0.0;
        let task = TaskView {
            request: ResourceRequest::new(1.0, 512.0, 0.0, 0.0),
            ..gpu_task("t1")
        };
        let picked = scheduler.select_worker(&task, &[wa]).unwrap();
        assert_eq!(picked, "wa");
        assert_eq!(scheduler.fallback_count(), 0);
    }

    #[test]
    fn test_missing_task_tau_scores_on_load_alone() {
        let (scheduler, _dir) = scheduler_with(ParameterBundle::default());
        let task = TaskView {
            tau_seconds: None,
            deadline: None,
            ..gpu_task("t1")
        };
        let candidates = vec![view("wa", 8.0, 0.9), view("wb", 8.0, 0.2)];
        assert_eq!(scheduler.select_worker(&task, &candidates).unwrap(), "wb");
    }

    #[test]
    fn test_hot_reload_changes_selection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        ParameterBundle::default().save(&path).unwrap();
        let scheduler = RtsScheduler::new(path.clone());

        let candidates = vec![view("wa", 8.0, 0.1), view("wb", 8.0, 0.2)];
        // Defaults: wa wins on lower load
        assert_eq!(
            scheduler.select_worker(&gpu_task("t7"), &candidates).unwrap(),
            "wa"
        );

        // Publish a bundle penalizing wa and refresh
        let mut updated = ParameterBundle::default();
        updated.penalty.insert("wa".to_string(), 50.0);
        updated.generated_at = 99;
        updated.save(&path).unwrap();
        scheduler.refresh_once();

        assert_eq!(
            scheduler.select_worker(&gpu_task("t8"), &candidates).unwrap(),
            "wb"
        );
    }

    #[test]
    fn test_malformed_reload_keeps_last_good_bundle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        let mut bundle = ParameterBundle::default();
        bundle.penalty.insert("wa".to_string(), 50.0);
        bundle.generated_at = 7;
        bundle.save(&path).unwrap();
        let scheduler = RtsScheduler::new(path.clone());

        std::fs::write(&path, "{ broken json").unwrap();
        scheduler.refresh_once();

        // The poisoned file was rejected; the old penalty still applies
        let candidates = vec![view("wa", 8.0, 0.1), view("wb", 8.0, 0.2)];
        assert_eq!(
            scheduler.select_worker(&gpu_task("t1"), &candidates).unwrap(),
            "wb"
        );
        assert_eq!(scheduler.current_params().generated_at, 7);
    }
}
