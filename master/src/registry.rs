//! In-memory worker registry for the master
//!
//! The registry is the authoritative view of the fleet: declared capacity,
//! current allocation, liveness, and the set of running tasks per worker.
//! Every mutation goes through a worker's own lock, and the reservation map
//! (task id -> reserved amounts) makes the accounting invariant
//! `allocated_r = sum of req_r over running tasks` structural rather than
//! something callers must maintain by hand. Mutations are mirrored to the
//! store best-effort; the in-memory state is the hot path.

use crate::database::{db_workers, MasterDatabase};
use shared::task::ResourceRequest;
use shared::worker::{WorkerInfo, WorkerUsage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Extra weight applied to the GPU term of the normalized load
const GPU_LOAD_EMPHASIS: f64 = 4.0;

/// Authoritative record of a single worker
#[derive(Debug)]
pub struct Worker {
    pub worker_id: String,
    pub address: String,
    pub total: ResourceRequest,
    pub allocated: ResourceRequest,
    pub is_active: bool,
    /// Monotonic time of the last heartbeat; liveness derives from this
    pub last_heartbeat: Option<Instant>,
    /// Wall-clock seconds of the last heartbeat, persisted best-effort
    pub last_heartbeat_unix: u64,
    pub usage: WorkerUsage,
    /// task_id -> reserved amounts. Always present; created empty by the
    /// constructor and only touched through Worker methods.
    running: HashMap<String, ResourceRequest>,
}

impl Worker {
    /// Every construction path goes through here so the running-task map can
    /// never be absent.
    fn new(worker_id: String, address: String, total: ResourceRequest) -> Self {
        Self {
            worker_id,
            address,
            total,
            allocated: ResourceRequest::default(),
            is_active: false,
            last_heartbeat: None,
            last_heartbeat_unix: 0,
            usage: WorkerUsage::default(),
            running: HashMap::new(),
        }
    }

    /// Capacity not currently allocated, clamped at zero
    pub fn available(&self) -> ResourceRequest {
        self.total.minus_clamped(&self.allocated)
    }

    pub fn running_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn running_task_count(&self) -> usize {
        self.running.len()
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// Normalized load in [0, 1] from the latest usage snapshot. Weights are
    /// proportional to declared capacity with the GPU term emphasized.
    pub fn normalized_load(&self) -> f64 {
        let w_cpu = self.total.cpu;
        let w_mem = self.total.mem_mb / 1024.0;
        let w_gpu = self.total.gpu * GPU_LOAD_EMPHASIS;
        let denom = w_cpu + w_mem + w_gpu;
        if denom <= 0.0 {
            return 0.0;
        }
        let weighted = w_cpu * self.usage.cpu_percent
            + w_mem * self.usage.mem_percent
            + w_gpu * self.usage.gpu_percent;
        (weighted / denom / 100.0).clamp(0.0, 1.0)
    }

    /// Reserve resources for a task. Fails when the task is already reserved
    /// or the request no longer fits.
    fn reserve(&mut self, task_id: &str, request: &ResourceRequest) -> Result<(), ReserveError> {
        if self.running.contains_key(task_id) {
            return Err(ReserveError::AlreadyReserved(task_id.to_string()));
        }
        if !request.fits_within(&self.available()) {
            return Err(ReserveError::Insufficient(self.worker_id.clone()));
        }
        self.allocated = self.allocated.plus(request);
        self.running.insert(task_id.to_string(), *request);
        Ok(())
    }

    /// Release a task's reservation. Idempotent: releasing an absent task is
    /// a no-op returning None.
    fn release(&mut self, task_id: &str) -> Option<ResourceRequest> {
        let request = self.running.remove(task_id)?;
        self.allocated = self.allocated.minus_clamped(&request);
        Some(request)
    }
}

/// Why a reservation was refused
#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
    #[error("Worker '{0}' is not registered")]
    UnknownWorker(String),
    #[error("Worker '{0}' is not active")]
    Inactive(String),
    #[error("Worker '{0}' no longer has sufficient resources")]
    Insufficient(String),
    #[error("Task '{0}' already holds a reservation")]
    AlreadyReserved(String),
}

/// Snapshot handed to schedulers: one active worker's identity, headroom, and load
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerView {
    pub worker_id: String,
    pub available: ResourceRequest,
    pub load: f64,
}

/// Outcome of a successful reservation, consumed by the assignment record
#[derive(Debug, Clone)]
pub struct ReservationReceipt {
    pub worker_id: String,
    pub address: String,
    pub worker_load: f64,
    pub available_before: ResourceRequest,
}

/// The fleet map. One reader/writer lock guards the map itself; each record
/// carries its own lock so per-worker mutations don't contend across workers.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<RwLock<Worker>>>>,
    db: Arc<Mutex<MasterDatabase>>,
    liveness_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(db: Arc<Mutex<MasterDatabase>>, liveness_timeout: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            db,
            liveness_timeout,
        }
    }

    /// Admin pre-registration: creates the record with zero capacity and
    /// inactive. The worker fills in capacity when it attaches.
    pub async fn register(&self, worker_id: &str, address: &str) -> shared::Result<()> {
        shared::utils::validate_worker_id(worker_id)?;
        shared::utils::validate_worker_address(address)?;

        let mut workers = self.workers.write().await;
        if workers.contains_key(worker_id) {
            return Err(shared::OrchestratorError::Validation(format!(
                "Worker '{}' is already registered",
                worker_id
            ))
            .into());
        }

        let worker = Worker::new(
            worker_id.to_string(),
            address.to_string(),
            ResourceRequest::default(),
        );
        self.persist(&worker).await;
        workers.insert(worker_id.to_string(), Arc::new(RwLock::new(worker)));
        info!(worker_id = %worker_id, address = %address, "Worker pre-registered");
        Ok(())
    }

    /// Worker-initiated attach: populates capacity and flips the record
    /// active. Creates the record when the worker was never pre-registered.
    pub async fn attach(&self, info: &WorkerInfo) -> shared::Result<()> {
        info.validate()?;

        let entry = {
            let mut workers = self.workers.write().await;
            workers
                .entry(info.worker_id.clone())
                .or_insert_with(|| {
                    Arc::new(RwLock::new(Worker::new(
                        info.worker_id.clone(),
                        info.address.clone(),
                        ResourceRequest::default(),
                    )))
                })
                .clone()
        };

        let snapshot = {
            let mut worker = entry.write().await;
            if worker.address != info.address {
                info!(
                    worker_id = %info.worker_id,
                    old = %worker.address,
                    new = %info.address,
                    "Worker attached with a new address"
                );
                worker.address = info.address.clone();
            }
            worker.total = info.capacity();
            worker.is_active = true;
            worker.last_heartbeat = Some(Instant::now());
            worker.last_heartbeat_unix = shared::utils::current_timestamp();
            worker.snapshot_for_store()
        };
        self.persist_snapshot(&snapshot).await;

        info!(
            worker_id = %info.worker_id,
            cpu = info.total_cpu,
            mem_mb = info.total_mem_mb,
            gpu = info.total_gpu,
            "Worker attached"
        );
        Ok(())
    }

    /// Apply a heartbeat. Returns false when the worker is unknown, in which
    /// case the caller should ask it to re-register.
    pub async fn heartbeat(&self, worker_id: &str, usage: WorkerUsage) -> bool {
        let Some(entry) = self.get(worker_id).await else {
            return false;
        };

        let snapshot = {
            let mut worker = entry.write().await;
            let was_active = worker.is_active;
            worker.usage = usage.clamped();
            worker.last_heartbeat = Some(Instant::now());
            worker.last_heartbeat_unix = shared::utils::current_timestamp();
            worker.is_active = true;
            if !was_active {
                info!(worker_id = %worker_id, "Worker became active again");
            }
            worker.snapshot_for_store()
        };
        self.persist_snapshot(&snapshot).await;
        true
    }

    /// Flip a worker inactive. Does not touch its allocations; those are
    /// released by result ingestion or reconciliation.
    pub async fn mark_inactive(&self, worker_id: &str) {
        if let Some(entry) = self.get(worker_id).await {
            let mut worker = entry.write().await;
            if worker.is_active {
                worker.is_active = false;
                info!(worker_id = %worker_id, "Worker marked inactive");
            }
        }
    }

    /// Sweep liveness: any worker whose last heartbeat is older than the
    /// timeout flips inactive. Returns the ids that changed state.
    pub async fn sweep_liveness(&self) -> Vec<String> {
        let entries: Vec<Arc<RwLock<Worker>>> =
            self.workers.read().await.values().cloned().collect();

        let mut flipped = Vec::new();
        for entry in entries {
            let mut worker = entry.write().await;
            if !worker.is_active {
                continue;
            }
            let stale = match worker.last_heartbeat {
                Some(at) => at.elapsed() >= self.liveness_timeout,
                None => true,
            };
            if stale {
                worker.is_active = false;
                warn!(
                    worker_id = %worker.worker_id,
                    running_tasks = worker.running_task_count(),
                    "Worker missed liveness deadline, marked inactive"
                );
                flipped.push(worker.worker_id.clone());
            }
        }
        flipped
    }

    pub async fn get(&self, worker_id: &str) -> Option<Arc<RwLock<Worker>>> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// All worker handles, id-sorted
    pub async fn list(&self) -> Vec<Arc<RwLock<Worker>>> {
        let workers = self.workers.read().await;
        let mut entries: Vec<(String, Arc<RwLock<Worker>>)> = workers
            .iter()
            .map(|(id, w)| (id.clone(), w.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, w)| w).collect()
    }

    /// Scheduler candidate views for every active worker, id-sorted
    pub async fn active_views(&self) -> Vec<WorkerView> {
        let mut views = Vec::new();
        for entry in self.list().await {
            let worker = entry.read().await;
            if worker.is_active {
                views.push(WorkerView {
                    worker_id: worker.worker_id.clone(),
                    available: worker.available(),
                    load: worker.normalized_load(),
                });
            }
        }
        views
    }

    /// Reserve resources for a task on a worker, re-checking feasibility
    /// under the worker's write lock.
    pub async fn reserve(
        &self,
        worker_id: &str,
        task_id: &str,
        request: &ResourceRequest,
    ) -> Result<ReservationReceipt, ReserveError> {
        let entry = self
            .get(worker_id)
            .await
            .ok_or_else(|| ReserveError::UnknownWorker(worker_id.to_string()))?;

        let (receipt, snapshot) = {
            let mut worker = entry.write().await;
            if !worker.is_active {
                return Err(ReserveError::Inactive(worker_id.to_string()));
            }
            let available_before = worker.available();
            let worker_load = worker.normalized_load();
            worker.reserve(task_id, request)?;
            (
                ReservationReceipt {
                    worker_id: worker.worker_id.clone(),
                    address: worker.address.clone(),
                    worker_load,
                    available_before,
                },
                worker.snapshot_for_store(),
            )
        };
        self.persist_snapshot(&snapshot).await;

        debug!(
            worker_id = %worker_id,
            task_id = %task_id,
            "Reserved resources"
        );
        Ok(receipt)
    }

    /// Release a task's reservation on a worker. Idempotent; returns true
    /// when something was actually released.
    pub async fn release(&self, worker_id: &str, task_id: &str) -> bool {
        let Some(entry) = self.get(worker_id).await else {
            return false;
        };

        let (released, snapshot) = {
            let mut worker = entry.write().await;
            let released = worker.release(task_id).is_some();
            (released, worker.snapshot_for_store())
        };

        if released {
            self.persist_snapshot(&snapshot).await;
            debug!(worker_id = %worker_id, task_id = %task_id, "Released resources");
        }
        released
    }

    /// Remove a worker entirely.
    pub async fn unregister(&self, worker_id: &str) -> shared::Result<()> {
        let removed = self.workers.write().await.remove(worker_id);
        if removed.is_none() {
            return Err(shared::OrchestratorError::Validation(format!(
                "Worker '{}' is not registered",
                worker_id
            ))
            .into());
        }

        let mut db = self.db.lock().await;
        match db.get_connection() {
            Ok(conn) => {
                if let Err(e) = db_workers::delete_worker(conn, worker_id) {
                    warn!(worker_id = %worker_id, error = %e, "Failed to delete worker from store");
                }
            }
            Err(e) => warn!(error = %e, "Store unavailable while unregistering worker"),
        }

        info!(worker_id = %worker_id, "Worker unregistered");
        Ok(())
    }

    /// Load persisted workers at startup. Every worker loads inactive until
    /// it heartbeats; allocations are re-established by the caller from the
    /// assignment records of running tasks.
    pub async fn load_from_store(&self) -> shared::Result<usize> {
        let rows = {
            let mut db = self.db.lock().await;
            let conn = db.get_connection()?;
            db_workers::load_all(conn)?
        };

        let mut workers = self.workers.write().await;
        let count = rows.len();
        for row in rows {
            let mut worker = Worker::new(row.worker_id.clone(), row.address, row.total);
            worker.last_heartbeat_unix = row.last_heartbeat;
            workers.insert(row.worker_id, Arc::new(RwLock::new(worker)));
        }
        Ok(count)
    }

    /// Re-establish a reservation from a persisted assignment during startup
    /// recovery. Skips the active check; the worker is inactive until it
    /// heartbeats but its allocation must match the assignment record.
    pub async fn restore_reservation(
        &self,
        worker_id: &str,
        task_id: &str,
        request: &ResourceRequest,
    ) -> bool {
        let Some(entry) = self.get(worker_id).await else {
            return false;
        };
        let mut worker = entry.write().await;
        worker.reserve(task_id, request).is_ok()
    }

    async fn persist(&self, worker: &Worker) {
        self.persist_snapshot(&worker.snapshot_for_store()).await;
    }

    async fn persist_snapshot(&self, snapshot: &WorkerStoreSnapshot) {
        let mut db = self.db.lock().await;
        match db.get_connection() {
            Ok(conn) => {
                if let Err(e) = db_workers::upsert_worker(
                    conn,
                    &snapshot.worker_id,
                    &snapshot.address,
                    &snapshot.total,
                    &snapshot.allocated,
                    snapshot.last_heartbeat_unix,
                ) {
                    warn!(worker_id = %snapshot.worker_id, error = %e, "Failed to persist worker");
                }
            }
            Err(e) => warn!(error = %e, "Store unavailable while persisting worker"),
        }
    }
}

/// Fields mirrored to the store on every mutation
#[derive(Debug, Clone)]
pub struct WorkerStoreSnapshot {
    pub worker_id: String,
    pub address: String,
    pub total: ResourceRequest,
    pub allocated: ResourceRequest,
    pub last_heartbeat_unix: u64,
}

impl Worker {
    fn snapshot_for_store(&self) -> WorkerStoreSnapshot {
        WorkerStoreSnapshot {
            worker_id: self.worker_id.clone(),
            address: self.address.clone(),
            total: self.total,
            allocated: self.allocated,
            last_heartbeat_unix: self.last_heartbeat_unix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_registry(liveness_secs: u64) -> (WorkerRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let registry = WorkerRegistry::new(
            Arc::new(Mutex::new(db)),
            Duration::from_secs(liveness_secs),
        );
        (registry, dir)
    }

    fn worker_info(worker_id: &str, cpu: f64) -> WorkerInfo {
        WorkerInfo {
            worker_id: worker_id.to_string(),
            address: "10.0.0.1:7070".to_string(),
            total_cpu: cpu,
            total_mem_mb: 16_384.0,
            total_storage_mb: 500_000.0,
            total_gpu: 0.0,
        }
    }

    #[tokio::test]
    async fn test_register_then_attach() {
        let (registry, _dir) = test_registry(30).await;

        registry.register("w1", "10.0.0.1:7070").await.unwrap();
        // Pre-registered workers are inactive with zero capacity
        let entry = registry.get("w1").await.unwrap();
        {
            let worker = entry.read().await;
            assert!(!worker.is_active);
            assert!(worker.total.is_zero());
            assert!(worker.running_task_ids().is_empty());
        }

        registry.attach(&worker_info("w1", 8.0)).await.unwrap();
        let worker = entry.read().await;
        assert!(worker.is_active);
        assert_eq!(worker.total.cpu, 8.0);
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected() {
        let (registry, _dir) = test_registry(30).await;
        registry.register("w1", "10.0.0.1:7070").await.unwrap();
        assert!(registry.register("w1", "10.0.0.1:7070").await.is_err());
    }

    #[tokio::test]
    async fn test_reserve_release_round_trip() {
        let (registry, _dir) = test_registry(30).await;
        registry.attach(&worker_info("w1", 8.0)).await.unwrap();

        let request = ResourceRequest::new(2.0, 1_024.0, 10_000.0, 0.0);
        let receipt = registry.reserve("w1", "t1", &request).await.unwrap();
        assert_eq!(receipt.worker_id, "w1");
        assert_eq!(receipt.available_before.cpu, 8.0);

        let entry = registry.get("w1").await.unwrap();
        {
            let worker = entry.read().await;
            assert_eq!(worker.allocated.cpu, 2.0);
            assert_eq!(worker.available().cpu, 6.0);
            assert!(worker.has_task("t1"));
        }

        assert!(registry.release("w1", "t1").await);
        let worker = entry.read().await;
        // reserve then release restores the original accounting exactly
        assert!(worker.allocated.is_zero());
        assert_eq!(worker.available().cpu, 8.0);
        assert!(worker.running_task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (registry, _dir) = test_registry(30).await;
        registry.attach(&worker_info("w1", 8.0)).await.unwrap();
        let request = ResourceRequest::new(2.0, 1_024.0, 0.0, 0.0);
        registry.reserve("w1", "t1", &request).await.unwrap();

        assert!(registry.release("w1", "t1").await);
        assert!(!registry.release("w1", "t1").await);
        assert!(!registry.release("w1", "never-reserved").await);

        let entry = registry.get("w1").await.unwrap();
        assert!(entry.read().await.allocated.is_zero());
    }

    #[tokio::test]
    async fn test_reserve_feasibility_boundary() {
        let (registry, _dir) = test_registry(30).await;
        registry.attach(&worker_info("w1", 4.0)).await.unwrap();

        // Exactly the available amount is admitted
        let exact = ResourceRequest::new(4.0, 16_384.0, 500_000.0, 0.0);
        assert!(registry.reserve("w1", "t1", &exact).await.is_ok());

        // Anything more is refused
        let over = ResourceRequest::new(0.1, 0.0, 0.0, 0.0);
        assert!(matches!(
            registry.reserve("w1", "t2", &over).await,
            Err(ReserveError::Insufficient(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_rejects_double_reservation() {
        let (registry, _dir) = test_registry(30).await;
        registry.attach(&worker_info("w1", 8.0)).await.unwrap();
        let request = ResourceRequest::new(1.0, 0.0, 0.0, 0.0);
        registry.reserve("w1", "t1", &request).await.unwrap();
        assert!(matches!(
            registry.reserve("w1", "t1", &request).await,
            Err(ReserveError::AlreadyReserved(_))
        ));
        // The failed second reserve did not change the allocation
        let entry = registry.get("w1").await.unwrap();
        assert_eq!(entry.read().await.allocated.cpu, 1.0);
    }

    #[tokio::test]
    async fn test_reserve_requires_active_worker() {
        let (registry, _dir) = test_registry(30).await;
        registry.register("w1", "10.0.0.1:7070").await.unwrap();
        let request = ResourceRequest::new(1.0, 0.0, 0.0, 0.0);
        assert!(matches!(
            registry.reserve("w1", "t1", &request).await,
            Err(ReserveError::Inactive(_))
        ));
        assert!(matches!(
            registry.reserve("nope", "t1", &request).await,
            Err(ReserveError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_liveness_flips_stale_workers() {
        let (registry, _dir) = test_registry(0).await;
        registry.attach(&worker_info("w1", 8.0)).await.unwrap();

        // Zero timeout: the worker is immediately stale
        let flipped = registry.sweep_liveness().await;
        assert_eq!(flipped, vec!["w1".to_string()]);

        let entry = registry.get("w1").await.unwrap();
        {
            let worker = entry.read().await;
            assert!(!worker.is_active);
        }

        // Sweeping again does nothing
        assert!(registry.sweep_liveness().await.is_empty());

        // A heartbeat reactivates the worker
        assert!(registry.heartbeat("w1", WorkerUsage::default()).await);
        assert!(entry.read().await.is_active);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker() {
        let (registry, _dir) = test_registry(30).await;
        assert!(!registry.heartbeat("ghost", WorkerUsage::default()).await);
    }

    #[tokio::test]
    async fn test_inactive_transition_keeps_allocations() {
        let (registry, _dir) = test_registry(30).await;
        registry.attach(&worker_info("w1", 8.0)).await.unwrap();
        let request = ResourceRequest::new(2.0, 0.0, 0.0, 0.0);
        registry.reserve("w1", "t1", &request).await.unwrap();

        registry.mark_inactive("w1").await;
        let entry = registry.get("w1").await.unwrap();
        let worker = entry.read().await;
        assert!(!worker.is_active);
        // Going inactive never releases resources by itself
        assert_eq!(worker.allocated.cpu, 2.0);
        assert!(worker.has_task("t1"));
    }

    #[tokio::test]
    async fn test_active_views_exclude_inactive() {
        let (registry, _dir) = test_registry(30).await;
        let mut info_a = worker_info("wa", 8.0);
        info_a.address = "10.0.0.1:7070".to_string();
        let mut info_b = worker_info("wb", 4.0);
        info_b.address = "10.0.0.2:7070".to_string();
        registry.attach(&info_a).await.unwrap();
        registry.attach(&info_b).await.unwrap();
        registry.mark_inactive("wb").await;

        let views = registry.active_views().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].worker_id, "wa");
        assert_eq!(views[0].available.cpu, 8.0);
    }

    #[tokio::test]
    async fn test_normalized_load_weighting() {
        let (registry, _dir) = test_registry(30).await;
        let mut info = worker_info("w1", 8.0);
        info.total_gpu = 2.0;
        registry.attach(&info).await.unwrap();

        registry
            .heartbeat(
                "w1",
                WorkerUsage {
                    cpu_percent: 0.0,
                    mem_percent: 0.0,
                    gpu_percent: 100.0,
                },
            )
            .await;

        let entry = registry.get("w1").await.unwrap();
        let load = entry.read().await.normalized_load();
        // GPU-only saturation dominates more than its share of raw capacity
        // because the GPU weight is emphasized.
        assert!(load > 0.2, "load = {}", load);
        assert!(load < 1.0);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = {
            let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
            db.initialize().await.unwrap();
            Arc::new(Mutex::new(db))
        };

        {
            let registry = WorkerRegistry::new(db.clone(), Duration::from_secs(30));
            registry.attach(&worker_info("w1", 8.0)).await.unwrap();
            registry
                .reserve("w1", "t1", &ResourceRequest::new(2.0, 512.0, 0.0, 0.0))
                .await
                .unwrap();
        }

        // A fresh registry over the same store sees the worker, inactive,
        // with its persisted allocation restorable from assignments.
        let registry = WorkerRegistry::new(db, Duration::from_secs(30));
        assert_eq!(registry.load_from_store().await.unwrap(), 1);
        let entry = registry.get("w1").await.unwrap();
        {
            let worker = entry.read().await;
            assert!(!worker.is_active);
            assert_eq!(worker.total.cpu, 8.0);
            // Allocations start empty until restore_reservation replays them
            assert!(worker.allocated.is_zero());
        }

        assert!(
            registry
                .restore_reservation("w1", "t1", &ResourceRequest::new(2.0, 512.0, 0.0, 0.0))
                .await
        );
        assert_eq!(entry.read().await.allocated.cpu, 2.0);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (registry, _dir) = test_registry(30).await;
        registry.attach(&worker_info("w1", 8.0)).await.unwrap();
        registry.unregister("w1").await.unwrap();
        assert!(registry.get("w1").await.is_none());
        assert!(registry.unregister("w1").await.is_err());
    }
}
