//! Assignment engine: places queued tasks onto workers
//!
//! A drain loop walks the queue in order on a fixed tick and whenever an
//! event could newly satisfy a queued task (heartbeat, worker attach, task
//! completion). For each entry it asks the scheduler for a worker, reserves
//! resources under the worker's lock, persists the assignment, and only then
//! sends the task over the network with a bounded timeout. A failed send
//! compensates: the reservation, the assignment record, and the task status
//! all roll back and the entry keeps its place in the queue with an
//! incremented retry count. Reserve-then-dispatch for one task is serialized,
//! so two workers can never both believe they own it.

use crate::database::{db_assignments, db_tasks, AssignmentRecord, MasterDatabase};
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::scheduler::{Scheduler, TaskView};
use crate::worker_client::WorkerClient;
use shared::task::{Task, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

pub struct AssignmentEngine {
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    scheduler: Arc<dyn Scheduler>,
    db: Arc<Mutex<MasterDatabase>>,
    client: WorkerClient,
    assign_timeout: Duration,
    /// Poked by heartbeat ingest, worker attach, and result ingest
    kick: Arc<Notify>,
}

/// Outcome of one placement attempt
#[derive(Debug)]
enum PlaceOutcome {
    Assigned { worker_id: String },
    NotPlaced { reason: String },
}

impl AssignmentEngine {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        queue: Arc<TaskQueue>,
        scheduler: Arc<dyn Scheduler>,
        db: Arc<Mutex<MasterDatabase>>,
        client: WorkerClient,
        assign_timeout: Duration,
        kick: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            scheduler,
            db,
            client,
            assign_timeout,
            kick,
        })
    }

    /// Queue-drain loop. Runs until shutdown.
    pub async fn run(
        self: Arc<Self>,
        tick_seconds: u64,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain().await;
                }
                _ = self.kick.notified() => {
                    self.drain().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Assignment engine received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One pass over the queue in order. Entries that cannot be placed stay
    /// where they are with an updated retry count; successfully dispatched
    /// entries leave the queue.
    pub async fn drain(&self) {
        let entries = self.queue.snapshot().await;
        if entries.is_empty() {
            return;
        }
        debug!(queued = entries.len(), "Draining task queue");

        for entry in entries {
            let task_id = entry.task.task_id.clone();
            // The entry may have been cancelled or placed since the snapshot
            if self.queue.position(&task_id).await.is_none() {
                continue;
            }

            match self.try_place(&entry.task, None).await {
                PlaceOutcome::Assigned { worker_id } => {
                    self.queue.remove(&task_id).await;
                    info!(
                        task_id = %task_id,
                        worker_id = %worker_id,
                        retries = entry.retries,
                        "Task dispatched"
                    );
                }
                PlaceOutcome::NotPlaced { reason } => {
                    self.queue.mark_failed_attempt(&task_id, &reason).await;
                }
            }
        }
    }

    /// Direct dispatch to an operator-chosen worker. Bypasses the scheduler
    /// but not the reserve/dispatch sequence.
    pub async fn dispatch_direct(&self, task_id: &str, worker_id: &str) -> shared::Result<()> {
        let entry = self.queue.remove(task_id).await.ok_or_else(|| {
            shared::OrchestratorError::Scheduling(format!("Task '{}' is not queued", task_id))
        })?;

        match self.try_place(&entry.task, Some(worker_id)).await {
            PlaceOutcome::Assigned { worker_id } => {
                info!(task_id = %task_id, worker_id = %worker_id, "Task dispatched directly");
                Ok(())
            }
            PlaceOutcome::NotPlaced { reason } => {
                self.queue.requeue(entry, &reason).await;
                Err(shared::OrchestratorError::Scheduling(reason).into())
            }
        }
    }

    async fn try_place(&self, task: &Task, forced_worker: Option<&str>) -> PlaceOutcome {
        let now = shared::utils::current_timestamp();
        let view = TaskView::from_task(task, now);

        let worker_id = match forced_worker {
            Some(worker_id) => worker_id.to_string(),
            None => {
                let candidates = self.registry.active_views().await;
                match self.scheduler.select_worker(&view, &candidates) {
                    Ok(worker_id) => worker_id,
                    Err(e) => {
                        return PlaceOutcome::NotPlaced {
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        // Reserve under the worker's lock; feasibility is re-checked there.
        let receipt = match self
            .registry
            .reserve(&worker_id, &task.task_id, &task.request)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                return PlaceOutcome::NotPlaced {
                    reason: e.to_string(),
                }
            }
        };

        // Persist status and assignment before the send. These are critical
        // writes: retried once, then the reservation is compensated.
        let assignment = AssignmentRecord {
            task_id: task.task_id.clone(),
            worker_id: worker_id.clone(),
            assigned_at: now,
            worker_load: receipt.worker_load,
            available_at_assign: receipt.available_before,
        };
        if let Err(e) = self.persist_dispatch(&assignment, now).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to persist dispatch, rolling back");
            self.rollback(&assignment, false).await;
            return PlaceOutcome::NotPlaced {
                reason: format!("store write failed: {}", e),
            };
        }

        // Network send happens outside every lock.
        match self
            .client
            .assign_task(&receipt.address, task, self.assign_timeout)
            .await
        {
            Ok(()) => PlaceOutcome::Assigned { worker_id },
            Err(e) => {
                warn!(
                    task_id = %task.task_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Assignment send failed, rolling back reservation"
                );
                self.rollback(&assignment, true).await;
                PlaceOutcome::NotPlaced {
                    reason: format!("send to {} failed: {}", worker_id, e),
                }
            }
        }
    }

    async fn persist_dispatch(
        &self,
        assignment: &AssignmentRecord,
        started_at: u64,
    ) -> anyhow::Result<()> {
        let mut db = self.db.lock().await;
        let conn = db.get_connection()?;

        let attempt = || -> anyhow::Result<()> {
            db_tasks::update_status(
                conn,
                &assignment.task_id,
                TaskStatus::Running,
                Some(started_at),
                None,
            )?;
            db_assignments::insert_assignment(conn, assignment)?;
            Ok(())
        };

        if let Err(first) = attempt() {
            warn!(
                task_id = %assignment.task_id,
                error = %first,
                "Dispatch persistence failed, retrying once"
            );
            // Remove a half-written assignment before retrying
            let _ = db_assignments::delete_assignment(conn, &assignment.task_id);
            db_tasks::update_status(
                conn,
                &assignment.task_id,
                TaskStatus::Running,
                Some(started_at),
                None,
            )?;
            db_assignments::insert_assignment(conn, assignment)?;
        }
        Ok(())
    }

    /// Compensate a failed dispatch: free the reservation and, when the store
    /// writes went through, restore the queued status and drop the
    /// assignment record.
    async fn rollback(&self, assignment: &AssignmentRecord, store_written: bool) {
        self.registry
            .release(&assignment.worker_id, &assignment.task_id)
            .await;

        if store_written {
            let mut db = self.db.lock().await;
            match db.get_connection() {
                Ok(conn) => {
                    if let Err(e) = db_assignments::delete_assignment(conn, &assignment.task_id) {
                        warn!(task_id = %assignment.task_id, error = %e, "Rollback: failed to delete assignment");
                    }
                    if let Err(e) = db_tasks::update_status(
                        conn,
                        &assignment.task_id,
                        TaskStatus::Queued,
                        None,
                        None,
                    ) {
                        warn!(task_id = %assignment.task_id, error = %e, "Rollback: failed to restore status");
                    }
                }
                Err(e) => warn!(error = %e, "Store unavailable during rollback"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::round_robin::RoundRobinScheduler;
    use axum::{routing::post, Json, Router};
    use shared::api::{AssignTaskRequest, TaskAck};
    use shared::task::{ResourceRequest, TaskType};
    use shared::worker::WorkerInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn stub_worker(ack_ok: bool) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let app = Router::new().route(
            shared::api::endpoints::TASK_ASSIGN,
            post(move |Json(_req): Json<AssignTaskRequest>| {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if ack_ok {
                        Json(TaskAck::ok())
                    } else {
                        Json(TaskAck::rejected("worker is draining".to_string()))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (address, hits)
    }

    struct Fixture {
        engine: Arc<AssignmentEngine>,
        registry: Arc<WorkerRegistry>,
        queue: Arc<TaskQueue>,
        db: Arc<Mutex<MasterDatabase>>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(Mutex::new(db));
        let registry = Arc::new(WorkerRegistry::new(db.clone(), Duration::from_secs(30)));
        let queue = Arc::new(TaskQueue::new());
        let engine = AssignmentEngine::new(
            registry.clone(),
            queue.clone(),
            Arc::new(RoundRobinScheduler::new()),
            db.clone(),
            WorkerClient::new("secret".to_string()).unwrap(),
            Duration::from_secs(2),
            Arc::new(Notify::new()),
        );
        Fixture {
            engine,
            registry,
            queue,
            db,
            _dir: dir,
        }
    }

    async fn attach_worker(fixture: &Fixture, worker_id: &str, address: &str) {
        fixture
            .registry
            .attach(&WorkerInfo {
                worker_id: worker_id.to_string(),
                address: address.to_string(),
                total_cpu: 8.0,
                total_mem_mb: 16_384.0,
                total_storage_mb: 500_000.0,
                total_gpu: 0.0,
            })
            .await
            .unwrap();
    }

    async fn queued_task(fixture: &Fixture, task_id: &str, cpu: f64) -> Task {
        let task = Task {
            task_id: task_id.to_string(),
            user_id: "alice".to_string(),
            task_name: task_id.to_string(),
            image: "hello-world".to_string(),
            command: vec![],
            request: ResourceRequest::new(cpu, 512.0, 1_024.0, 0.0),
            task_type: TaskType::CpuLight,
            tau_seconds: Some(30.0),
            sla_multiplier: 2.0,
            submitted_at: shared::utils::current_timestamp(),
            status: TaskStatus::Queued,
            started_at: None,
            completed_at: None,
        };
        {
            let mut db = fixture.db.lock().await;
            let conn = db.get_connection().unwrap();
            db_tasks::insert_task(conn, &task).unwrap();
        }
        fixture.queue.enqueue(task.clone()).await;
        task
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let fixture = fixture().await;
        let (address, hits) = stub_worker(true).await;
        attach_worker(&fixture, "w1", &address).await;
        queued_task(&fixture, "t1", 1.0).await;

        fixture.engine.drain().await;

        // Queue emptied, worker hit once, resources reserved, records written
        assert_eq!(fixture.queue.len().await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let entry = fixture.registry.get("w1").await.unwrap();
        {
            let worker = entry.read().await;
            assert!(worker.has_task("t1"));
            assert_eq!(worker.allocated.cpu, 1.0);
        }

        let mut db = fixture.db.lock().await;
        let conn = db.get_connection().unwrap();
        let task = db_tasks::get_task(conn, "t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        let assignment = db_assignments::get_assignment(conn, "t1").unwrap().unwrap();
        assert_eq!(assignment.worker_id, "w1");
        assert_eq!(assignment.available_at_assign.cpu, 8.0);
    }

    #[tokio::test]
    async fn test_send_failure_rolls_back() {
        let fixture = fixture().await;
        // No listener at this address: the send times out / errors
        attach_worker(&fixture, "w1", "127.0.0.1:1").await;
        queued_task(&fixture, "t1", 1.0).await;

        fixture.engine.drain().await;

        // Entry stays queued with a recorded failure
        assert_eq!(fixture.queue.len().await, 1);
        let snapshot = fixture.queue.snapshot().await;
        assert_eq!(snapshot[0].retries, 1);
        assert!(snapshot[0].last_error.is_some());

        // Reservation was compensated exactly
        let entry = fixture.registry.get("w1").await.unwrap();
        {
            let worker = entry.read().await;
            assert!(!worker.has_task("t1"));
            assert!(worker.allocated.is_zero());
        }

        // Store rolled back to queued with no assignment
        let mut db = fixture.db.lock().await;
        let conn = db.get_connection().unwrap();
        let task = db_tasks::get_task(conn, "t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(db_assignments::get_assignment(conn, "t1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_declined_ack_rolls_back() {
        let fixture = fixture().await;
        let (address, hits) = stub_worker(false).await;
        attach_worker(&fixture, "w1", &address).await;
        queued_task(&fixture, "t1", 1.0).await;

        fixture.engine.drain().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.queue.len().await, 1);
        let entry = fixture.registry.get("w1").await.unwrap();
        assert!(entry.read().await.allocated.is_zero());
    }

    #[tokio::test]
    async fn test_infeasible_task_stays_queued_with_retries() {
        let fixture = fixture().await;
        let (address, _hits) = stub_worker(true).await;
        attach_worker(&fixture, "w1", &address).await;
        // Requests more CPU than the worker has
        queued_task(&fixture, "t-big", 64.0).await;

        fixture.engine.drain().await;
        fixture.engine.drain().await;

        let snapshot = fixture.queue.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].retries, 2);
        assert_eq!(
            snapshot[0].last_error.as_deref(),
            Some("no feasible worker for task")
        );
    }

    #[tokio::test]
    async fn test_infeasible_until_capacity_frees() {
        let fixture = fixture().await;
        let (address, _hits) = stub_worker(true).await;
        attach_worker(&fixture, "w1", &address).await;

        // Fill the worker so the new task cannot fit
        fixture
            .registry
            .reserve("w1", "t-running", &ResourceRequest::new(6.0, 0.0, 0.0, 0.0))
            .await
            .unwrap();
        queued_task(&fixture, "t3", 4.0).await;

        fixture.engine.drain().await;
        assert_eq!(fixture.queue.len().await, 1);
        assert!(fixture.queue.snapshot().await[0].retries > 0);

        // A completion frees capacity; the next drain places the task
        fixture.registry.release("w1", "t-running").await;
        fixture.engine.drain().await;
        assert_eq!(fixture.queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_skip_infeasible_head_preserves_order() {
        let fixture = fixture().await;
        let (address, _hits) = stub_worker(true).await;
        attach_worker(&fixture, "w1", &address).await;

        queued_task(&fixture, "t-head-too-big", 64.0).await;
        queued_task(&fixture, "t-fits", 1.0).await;

        fixture.engine.drain().await;

        // The infeasible head stays at the head; the feasible entry left
        let snapshot = fixture.queue.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].task.task_id, "t-head-too-big");
    }

    #[tokio::test]
    async fn test_dispatch_direct_bypasses_scheduler_not_reservation() {
        let fixture = fixture().await;
        let (address, hits) = stub_worker(true).await;
        attach_worker(&fixture, "w1", &address).await;
        queued_task(&fixture, "t1", 1.0).await;

        fixture.engine.dispatch_direct("t1", "w1").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let entry = fixture.registry.get("w1").await.unwrap();
        assert!(entry.read().await.has_task("t1"));

        // Direct dispatch of an unknown task errors
        assert!(fixture.engine.dispatch_direct("ghost", "w1").await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_direct_infeasible_requeues() {
        let fixture = fixture().await;
        let (address, _hits) = stub_worker(true).await;
        attach_worker(&fixture, "w1", &address).await;
        queued_task(&fixture, "t-big", 64.0).await;

        assert!(fixture.engine.dispatch_direct("t-big", "w1").await.is_err());
        // The task went back to the queue instead of vanishing
        assert_eq!(fixture.queue.len().await, 1);
    }
}
