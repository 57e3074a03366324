//! Reconnection monitor and stale-allocation reconciler
//!
//! The monitor periodically probes workers the liveness sweep flipped
//! inactive. A probe that answers gets a `MasterRegister` push so the worker
//! re-runs the normal registration handshake; probes that fail stay silent,
//! the worker is simply tried again next period.
//!
//! The reconciler restores the resource-accounting invariant after crashes:
//! when a worker attaches, the task ids it declares are compared with the
//! master's view, and every task the worker no longer reports gets a
//! synthetic `failed` completion through the ingestor. The single-result
//! invariant makes the synthesis idempotent across however many passes run.

use crate::ingest::ResultIngestor;
use crate::registry::WorkerRegistry;
use crate::worker_client::WorkerClient;
use shared::api::{MasterInfo, TaskResultReport};
use shared::task::TaskStatus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ReconnectionMonitor {
    registry: Arc<WorkerRegistry>,
    client: WorkerClient,
    master: MasterInfo,
    probe_timeout: Duration,
}

impl ReconnectionMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        client: WorkerClient,
        master: MasterInfo,
        probe_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            client,
            master,
            probe_timeout,
        })
    }

    /// Monitor loop. Runs until shutdown.
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
                    self.probe_inactive_workers().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Reconnection monitor received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One pass over every inactive worker.
    pub async fn probe_inactive_workers(&self) {
        for entry in self.registry.list().await {
            let (worker_id, address, is_active) = {
                let worker = entry.read().await;
                (
                    worker.worker_id.clone(),
                    worker.address.clone(),
                    worker.is_active,
                )
            };
            if is_active {
                continue;
            }

            // Failed probes are expected while a worker is down; stay quiet.
            if self
                .client
                .probe_health(&address, self.probe_timeout)
                .await
                .is_err()
            {
                debug!(worker_id = %worker_id, "Reconnect probe unanswered");
                continue;
            }

            info!(worker_id = %worker_id, "Inactive worker answered probe, requesting registration");
            if let Err(e) = self
                .client
                .master_register(&address, &self.master, self.probe_timeout)
                .await
            {
                debug!(worker_id = %worker_id, error = %e, "MasterRegister push failed");
            }
        }
    }
}

/// Compare a worker's declared running set with the master's view and
/// synthesize `failed` completions for tasks the worker dropped. Invoked on
/// worker attach and on demand.
pub async fn reconcile_worker(
    registry: &WorkerRegistry,
    ingestor: &ResultIngestor,
    worker_id: &str,
    declared_running: &[String],
) -> usize {
    let Some(entry) = registry.get(worker_id).await else {
        return 0;
    };

    let declared: HashSet<&str> = declared_running.iter().map(|s| s.as_str()).collect();
    let master_view = entry.read().await.running_task_ids();

    let orphaned: Vec<String> = master_view
        .into_iter()
        .filter(|task_id| !declared.contains(task_id.as_str()))
        .collect();

    if orphaned.is_empty() {
        return 0;
    }

    warn!(
        worker_id = %worker_id,
        orphaned = orphaned.len(),
        "Worker no longer reports tasks the master thought were running; synthesizing failures"
    );

    let now = shared::utils::current_timestamp();
    let mut synthesized = 0;
    for task_id in orphaned {
        let report = TaskResultReport {
            task_id: task_id.clone(),
            worker_id: worker_id.to_string(),
            status: TaskStatus::Failed,
            logs: "task lost: worker no longer reports it".to_string(),
            output_files: vec![],
            sla_success: Some(false),
            completed_at: now,
        };
        match ingestor.ingest(&report).await {
            Ok(_) => synthesized += 1,
            Err(e) => warn!(
                task_id = %task_id,
                error = %e,
                "Failed to synthesize completion for orphaned task"
            ),
        }
    }
    synthesized
}
