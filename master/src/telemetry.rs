//! Telemetry hub for worker heartbeats
//!
//! Each worker gets its own bounded feed and a dedicated consumer task, so a
//! flood from one worker never delays another and heartbeats from a single
//! worker are always processed in arrival order. The feed drops its oldest
//! entry on overflow; the RPC handler never blocks. Consumers update the
//! registry, append a usage sample for the trainer, refresh the latest
//! snapshot, and fan processed heartbeats out to streaming observers.

use crate::database::{db_worker_stats, MasterDatabase, WorkerStatsSample};
use crate::registry::WorkerRegistry;
use shared::api::HeartbeatRequest;
use shared::worker::WorkerUsage;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Load above this fraction counts the interval as overloaded
const OVERLOAD_THRESHOLD: f64 = 0.9;

/// Intervals longer than this are clipped; the worker was gone, not busy
const MAX_SAMPLE_INTERVAL_SECONDS: f64 = 60.0;

/// Latest processed telemetry for one worker
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    pub worker_id: String,
    pub usage: WorkerUsage,
    pub running_task_ids: Vec<String>,
    pub load: f64,
    pub timestamp: u64,
}

/// Single-consumer bounded feed for one worker's heartbeats
struct WorkerFeed {
    queue: Mutex<VecDeque<HeartbeatRequest>>,
    notify: Notify,
    latest: RwLock<Option<TelemetrySnapshot>>,
    stream: broadcast::Sender<TelemetrySnapshot>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerFeed {
    fn new() -> Self {
        let (stream, _) = broadcast::channel(16);
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            latest: RwLock::new(None),
            stream,
            consumer: Mutex::new(None),
        }
    }
}

/// Ingests heartbeats and serves snapshot and streaming reads
pub struct TelemetryHub {
    registry: Arc<WorkerRegistry>,
    db: Arc<Mutex<MasterDatabase>>,
    feeds: RwLock<HashMap<String, Arc<WorkerFeed>>>,
    capacity: usize,
    /// Poked after every processed heartbeat so the assignment engine can
    /// retry queued tasks that may newly fit
    kick: Arc<Notify>,
}

impl TelemetryHub {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        db: Arc<Mutex<MasterDatabase>>,
        capacity: usize,
        kick: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            db,
            feeds: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            kick,
        })
    }

    /// Enqueue a heartbeat for the worker's consumer. Never blocks: when the
    /// feed is full the oldest pending heartbeat is dropped.
    pub async fn ingest(self: &Arc<Self>, heartbeat: HeartbeatRequest) {
        let feed = self.feed_for(&heartbeat.worker_id).await;

        {
            let mut queue = feed.queue.lock().await;
            if queue.len() >= self.capacity {
                queue.pop_front();
                debug!(
                    worker_id = %heartbeat.worker_id,
                    capacity = self.capacity,
                    "Heartbeat feed full, dropped oldest entry"
                );
            }
            queue.push_back(heartbeat);
        }
        feed.notify.notify_one();
    }

    /// Latest processed telemetry for a worker
    pub async fn snapshot(&self, worker_id: &str) -> Option<TelemetrySnapshot> {
        let feed = self.feeds.read().await.get(worker_id).cloned()?;
        let latest = feed.latest.read().await;
        latest.clone()
    }

    /// Subscribe to the stream of processed heartbeats for a worker
    pub async fn subscribe(&self, worker_id: &str) -> Option<broadcast::Receiver<TelemetrySnapshot>> {
        let feed = self.feeds.read().await.get(worker_id).cloned()?;
        Some(feed.stream.subscribe())
    }

    /// Abort every consumer task. Called during master shutdown.
    pub async fn shutdown(&self) {
        let feeds = self.feeds.read().await;
        for feed in feeds.values() {
            if let Some(handle) = feed.consumer.lock().await.take() {
                handle.abort();
            }
        }
    }

    async fn feed_for(self: &Arc<Self>, worker_id: &str) -> Arc<WorkerFeed> {
        if let Some(feed) = self.feeds.read().await.get(worker_id).cloned() {
            return feed;
        }

        let mut feeds = self.feeds.write().await;
        if let Some(feed) = feeds.get(worker_id).cloned() {
            return feed;
        }

        let feed = Arc::new(WorkerFeed::new());
        let handle = tokio::spawn(Self::consume(
            self.clone(),
            worker_id.to_string(),
            feed.clone(),
        ));
        *feed.consumer.lock().await = Some(handle);
        feeds.insert(worker_id.to_string(), feed.clone());
        feed
    }

    /// Per-worker consumer loop: drains the feed in arrival order.
    async fn consume(hub: Arc<TelemetryHub>, worker_id: String, feed: Arc<WorkerFeed>) {
        let mut last_sample: Option<Instant> = None;
        loop {
            feed.notify.notified().await;
            loop {
                let heartbeat = {
                    let mut queue = feed.queue.lock().await;
                    queue.pop_front()
                };
                let Some(heartbeat) = heartbeat else { break };
                hub.process(&worker_id, heartbeat, &feed, &mut last_sample)
                    .await;
            }
        }
    }

    async fn process(
        &self,
        worker_id: &str,
        heartbeat: HeartbeatRequest,
        feed: &WorkerFeed,
        last_sample: &mut Option<Instant>,
    ) {
        let usage = heartbeat.usage.clamped();
        if !self.registry.heartbeat(worker_id, usage).await {
            debug!(worker_id = %worker_id, "Heartbeat for unknown worker ignored by consumer");
            return;
        }

        let load = match self.registry.get(worker_id).await {
            Some(entry) => entry.read().await.normalized_load(),
            None => 0.0,
        };

        // Usage sample for the trainer window: fraction-seconds since the
        // previous heartbeat, clipped so a long outage doesn't count as load.
        let now = Instant::now();
        if let Some(prev) = last_sample {
            let interval = now
                .duration_since(*prev)
                .as_secs_f64()
                .min(MAX_SAMPLE_INTERVAL_SECONDS);
            if interval > 0.0 {
                let sample = WorkerStatsSample {
                    worker_id: worker_id.to_string(),
                    sample_time: shared::utils::current_timestamp(),
                    interval_seconds: interval,
                    cpu_seconds: usage.cpu_percent / 100.0 * interval,
                    mem_seconds: usage.mem_percent / 100.0 * interval,
                    gpu_seconds: usage.gpu_percent / 100.0 * interval,
                    overload_seconds: if load > OVERLOAD_THRESHOLD {
                        interval
                    } else {
                        0.0
                    },
                };
                let mut db = self.db.lock().await;
                match db.get_connection() {
                    Ok(conn) => {
                        if let Err(e) = db_worker_stats::insert_sample(conn, &sample) {
                            warn!(worker_id = %worker_id, error = %e, "Failed to record stats sample");
                        }
                    }
                    Err(e) => warn!(error = %e, "Store unavailable while recording stats sample"),
                }
            }
        }
        *last_sample = Some(now);

        let snapshot = TelemetrySnapshot {
            worker_id: worker_id.to_string(),
            usage,
            running_task_ids: heartbeat
                .running_tasks
                .iter()
                .map(|t| t.task_id.clone())
                .collect(),
            load,
            timestamp: heartbeat.timestamp,
        };

        *feed.latest.write().await = Some(snapshot.clone());
        let _ = feed.stream.send(snapshot);

        // A heartbeat can mean newly available headroom
        self.kick.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MasterDatabase;
    use shared::worker::WorkerInfo;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn test_hub() -> (Arc<TelemetryHub>, Arc<WorkerRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(Mutex::new(db));
        let registry = Arc::new(WorkerRegistry::new(db.clone(), Duration::from_secs(30)));
        let hub = TelemetryHub::new(registry.clone(), db, 10, Arc::new(Notify::new()));
        (hub, registry, dir)
    }

    fn heartbeat(worker_id: &str, cpu: f64, timestamp: u64) -> HeartbeatRequest {
        HeartbeatRequest {
            worker_id: worker_id.to_string(),
            usage: WorkerUsage {
                cpu_percent: cpu,
                mem_percent: 0.0,
                gpu_percent: 0.0,
            },
            running_tasks: vec![],
            timestamp,
        }
    }

    async fn attach_worker(registry: &WorkerRegistry, worker_id: &str) {
        registry
            .attach(&WorkerInfo {
                worker_id: worker_id.to_string(),
                address: "10.0.0.1:7070".to_string(),
                total_cpu: 8.0,
                total_mem_mb: 16_384.0,
                total_storage_mb: 500_000.0,
                total_gpu: 0.0,
            })
            .await
            .unwrap();
    }

    async fn wait_for_snapshot(
        hub: &Arc<TelemetryHub>,
        worker_id: &str,
        predicate: impl Fn(&TelemetrySnapshot) -> bool,
    ) -> TelemetrySnapshot {
        for _ in 0..100 {
            if let Some(snapshot) = hub.snapshot(worker_id).await {
                if predicate(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("snapshot for {} never satisfied predicate", worker_id);
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_registry_and_snapshot() {
        let (hub, registry, _dir) = test_hub().await;
        attach_worker(&registry, "w1").await;

        hub.ingest(heartbeat("w1", 42.0, 100)).await;
        let snapshot = wait_for_snapshot(&hub, "w1", |s| s.timestamp == 100).await;
        assert_eq!(snapshot.usage.cpu_percent, 42.0);

        let entry = registry.get("w1").await.unwrap();
        assert_eq!(entry.read().await.usage.cpu_percent, 42.0);
    }

    #[tokio::test]
    async fn test_heartbeats_processed_in_arrival_order() {
        let (hub, registry, _dir) = test_hub().await;
        attach_worker(&registry, "w1").await;

        for i in 0..5u64 {
            hub.ingest(heartbeat("w1", i as f64, i)).await;
        }
        // The latest snapshot reflects the last heartbeat, not any earlier one
        let snapshot = wait_for_snapshot(&hub, "w1", |s| s.timestamp == 4).await;
        assert_eq!(snapshot.usage.cpu_percent, 4.0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_not_newest() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(Mutex::new(db));
        let registry = Arc::new(WorkerRegistry::new(db.clone(), Duration::from_secs(30)));
        // Capacity 2 to force overflow deterministically
        let hub = TelemetryHub::new(registry.clone(), db, 2, Arc::new(Notify::new()));
        attach_worker(&registry, "w1").await;

        // The consumer may drain entries while we push; regardless, the
        // newest heartbeat must always survive.
        for i in 0..20u64 {
            hub.ingest(heartbeat("w1", i as f64, i)).await;
        }
        let snapshot = wait_for_snapshot(&hub, "w1", |s| s.timestamp == 19).await;
        assert_eq!(snapshot.usage.cpu_percent, 19.0);
    }

    #[tokio::test]
    async fn test_subscribe_streams_processed_heartbeats() {
        let (hub, registry, _dir) = test_hub().await;
        attach_worker(&registry, "w1").await;

        hub.ingest(heartbeat("w1", 1.0, 1)).await;
        wait_for_snapshot(&hub, "w1", |s| s.timestamp == 1).await;

        let mut rx = hub.subscribe("w1").await.unwrap();
        hub.ingest(heartbeat("w1", 2.0, 2)).await;
        let streamed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(streamed.timestamp, 2);
    }

    #[tokio::test]
    async fn test_unknown_worker_snapshot_is_none() {
        let (hub, _registry, _dir) = test_hub().await;
        assert!(hub.snapshot("ghost").await.is_none());
        assert!(hub.subscribe("ghost").await.is_none());
    }
}
