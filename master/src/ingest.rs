//! Result ingestor: accepts terminal task reports from workers
//!
//! Two invariants rule this path. Status preservation: once a task reads
//! `cancelled`, no report may move it elsewhere; the only report that still
//! matters is the cancellation confirmation, which may create the result row.
//! Single result: at most one result row ever exists per task, so the
//! crash-report/cancellation-confirmation pairs workers emit around a cancel
//! collapse to one record. Resource release is idempotent and keyed by the
//! assignment's worker, which stays authoritative even when a report claims a
//! different sender.

use crate::database::{
    db_assignments, db_history, db_results, db_tasks, HistoryRecord, MasterDatabase, StoredResult,
};
use crate::registry::WorkerRegistry;
use shared::api::{ResultAck, TaskResultReport};
use shared::task::TaskStatus;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

pub struct ResultIngestor {
    registry: Arc<WorkerRegistry>,
    db: Arc<Mutex<MasterDatabase>>,
    /// Poked after every release so the assignment engine can retry queued tasks
    kick: Arc<Notify>,
}

impl ResultIngestor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        db: Arc<Mutex<MasterDatabase>>,
        kick: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self { registry, db, kick })
    }

    /// Ingest a terminal report. Always succeeds from the worker's point of
    /// view unless the report itself is malformed; suppressed reports are
    /// acked so workers stop retrying them.
    pub async fn ingest(&self, report: &TaskResultReport) -> shared::Result<ResultAck> {
        if !report.status.is_terminal() {
            return Err(shared::OrchestratorError::Validation(format!(
                "Result for task '{}' carries non-terminal status '{}'",
                report.task_id,
                report.status.as_str()
            ))
            .into());
        }

        let (task, assignment) = {
            let mut db = self.db.lock().await;
            let conn = db.get_connection()?;
            (
                db_tasks::get_task(conn, &report.task_id)?,
                db_assignments::get_assignment(conn, &report.task_id)?,
            )
        };

        let Some(task) = task else {
            warn!(
                task_id = %report.task_id,
                worker_id = %report.worker_id,
                "Result for unknown task ignored"
            );
            return Ok(ResultAck::suppressed());
        };

        // The assignment's worker owns the resources regardless of who reports.
        let owner = assignment
            .as_ref()
            .map(|a| a.worker_id.clone())
            .unwrap_or_else(|| report.worker_id.clone());
        if owner != report.worker_id {
            warn!(
                task_id = %report.task_id,
                reporter = %report.worker_id,
                assigned = %owner,
                "Report worker disagrees with assignment; assignment wins for release"
            );
        }

        // Status preservation against cancelled.
        if task.status == TaskStatus::Cancelled {
            self.release_and_kick(&owner, &report.task_id).await;

            if report.status == TaskStatus::Cancelled {
                // The cancellation confirmation may create the single result row.
                let inserted = self
                    .store_result(report, report.sla_success.unwrap_or(false))
                    .await?;
                return Ok(if inserted {
                    ResultAck::recorded()
                } else {
                    ResultAck::suppressed()
                });
            }

            info!(
                task_id = %report.task_id,
                reported = %report.status.as_str(),
                "Ignored status overwrite attempt against cancelled task"
            );
            return Ok(ResultAck::suppressed());
        }

        // Single-result invariant: a second report changes nothing.
        let already_recorded = {
            let mut db = self.db.lock().await;
            let conn = db.get_connection()?;
            db_results::exists(conn, &report.task_id)?
        };
        if already_recorded {
            debug!(task_id = %report.task_id, "Duplicate result suppressed");
            self.release_and_kick(&owner, &report.task_id).await;
            return Ok(ResultAck::suppressed());
        }

        // Worker verdict wins when present; otherwise derive from the deadline
        // (completion exactly at the deadline is a success).
        let sla_success = report
            .sla_success
            .unwrap_or_else(|| task.meets_sla(report.completed_at));

        // Status write. The lattice only refuses transitions that would
        // rewrite terminal history; a repeated identical status is fine to
        // skip while the rest of the ingest still proceeds.
        if task.status.can_transition_to(report.status) {
            self.update_task_status(report).await?;
        } else if task.status != report.status {
            warn!(
                task_id = %report.task_id,
                from = %task.status.as_str(),
                to = %report.status.as_str(),
                "Report carries an inadmissible status transition; keeping stored status"
            );
        }

        let inserted = self.store_result(report, sla_success).await?;
        self.release_and_kick(&owner, &report.task_id).await;

        // History record for the trainer. Best-effort: losing one sample is
        // not worth failing the worker's report.
        let started = task.started_at.unwrap_or(task.submitted_at);
        let record = HistoryRecord {
            task_id: task.task_id.clone(),
            task_type: task.task_type.as_str().to_string(),
            worker_id: owner.clone(),
            tau_seconds: task.tau_seconds,
            actual_runtime: report.completed_at.saturating_sub(started) as f64,
            sla_success,
            arrival_time: task.submitted_at,
            deadline: task.deadline(),
            request: task.request,
            worker_load: assignment.as_ref().map(|a| a.worker_load).unwrap_or(0.0),
            available_at_assign: assignment
                .as_ref()
                .map(|a| a.available_at_assign)
                .unwrap_or_default(),
        };
        {
            let mut db = self.db.lock().await;
            match db.get_connection() {
                Ok(conn) => {
                    if let Err(e) = db_history::insert_record(conn, &record) {
                        warn!(task_id = %task.task_id, error = %e, "Failed to append history record");
                    }
                }
                Err(e) => warn!(error = %e, "Store unavailable for history record"),
            }
        }

        info!(
            task_id = %report.task_id,
            worker_id = %owner,
            status = %report.status.as_str(),
            sla_success = sla_success,
            "Task result ingested"
        );
        Ok(if inserted {
            ResultAck::recorded()
        } else {
            ResultAck::suppressed()
        })
    }

    /// Critical write: retried once before surfacing.
    async fn update_task_status(&self, report: &TaskResultReport) -> shared::Result<()> {
        let mut db = self.db.lock().await;
        let conn = db.get_connection()?;
        if let Err(first) = db_tasks::update_status(
            conn,
            &report.task_id,
            report.status,
            None,
            Some(report.completed_at),
        ) {
            warn!(
                task_id = %report.task_id,
                error = %first,
                "Status write failed, retrying once"
            );
            db_tasks::update_status(
                conn,
                &report.task_id,
                report.status,
                None,
                Some(report.completed_at),
            )?;
        }
        Ok(())
    }

    /// Critical write: retried once before surfacing. Returns whether the row
    /// was newly inserted.
    async fn store_result(
        &self,
        report: &TaskResultReport,
        sla_success: bool,
    ) -> shared::Result<bool> {
        let stored = StoredResult {
            task_id: report.task_id.clone(),
            worker_id: report.worker_id.clone(),
            status: report.status,
            logs: report.logs.clone(),
            output_files: report.output_files.clone(),
            sla_success,
            completed_at: report.completed_at,
            received_at: 0,
        };

        let mut db = self.db.lock().await;
        let conn = db.get_connection()?;
        match db_results::insert_if_absent(conn, &stored) {
            Ok(inserted) => Ok(inserted),
            Err(first) => {
                warn!(
                    task_id = %report.task_id,
                    error = %first,
                    "Result write failed, retrying once"
                );
                Ok(db_results::insert_if_absent(conn, &stored)?)
            }
        }
    }

    async fn release_and_kick(&self, worker_id: &str, task_id: &str) {
        if self.registry.release(worker_id, task_id).await {
            self.kick.notify_one();
        }
    }
}
