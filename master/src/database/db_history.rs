//! Task history collection operations for the master
//!
//! One row per completed task execution; the trainer's primary input. Each
//! record captures what the scheduler knew at assignment time (load,
//! availability) alongside what actually happened, so the regression can fit
//! the execution-time model offline.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use shared::task::ResourceRequest;

/// A completed execution as consumed by the trainer
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub task_id: String,
    pub task_type: String,
    pub worker_id: String,
    pub tau_seconds: Option<f64>,
    pub actual_runtime: f64,
    pub sla_success: bool,
    /// Submission time of the task (Unix seconds)
    pub arrival_time: u64,
    /// Absolute SLA deadline, when the task had one
    pub deadline: Option<u64>,
    pub request: ResourceRequest,
    /// Worker load at assignment
    pub worker_load: f64,
    /// Worker availability just before the reservation
    pub available_at_assign: ResourceRequest,
}

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            worker_id TEXT NOT NULL,
            tau_seconds REAL,
            actual_runtime REAL NOT NULL,
            sla_success INTEGER NOT NULL,
            arrival_time INTEGER NOT NULL,
            deadline INTEGER,
            req_cpu REAL NOT NULL,
            req_mem_mb REAL NOT NULL,
            req_storage_mb REAL NOT NULL,
            req_gpu REAL NOT NULL,
            worker_load REAL NOT NULL,
            avail_cpu REAL NOT NULL,
            avail_mem_mb REAL NOT NULL,
            avail_storage_mb REAL NOT NULL,
            avail_gpu REAL NOT NULL,
            recorded_at INTEGER DEFAULT (strftime('%s', 'now'))
        )
        "#,
        [],
    )
    .context("Failed to create task_history table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_recorded ON task_history(recorded_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_worker ON task_history(worker_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_type ON task_history(task_type)",
        [],
    )?;

    Ok(())
}

fn row_to_record(row: &Row) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        task_id: row.get("task_id")?,
        task_type: row.get("task_type")?,
        worker_id: row.get("worker_id")?,
        tau_seconds: row.get("tau_seconds")?,
        actual_runtime: row.get("actual_runtime")?,
        sla_success: row.get::<_, i64>("sla_success")? != 0,
        arrival_time: row.get::<_, i64>("arrival_time")? as u64,
        deadline: row.get::<_, Option<i64>>("deadline")?.map(|v| v as u64),
        request: ResourceRequest {
            cpu: row.get("req_cpu")?,
            mem_mb: row.get("req_mem_mb")?,
            storage_mb: row.get("req_storage_mb")?,
            gpu: row.get("req_gpu")?,
        },
        worker_load: row.get("worker_load")?,
        available_at_assign: ResourceRequest {
            cpu: row.get("avail_cpu")?,
            mem_mb: row.get("avail_mem_mb")?,
            storage_mb: row.get("avail_storage_mb")?,
            gpu: row.get("avail_gpu")?,
        },
    })
}

/// Append a history record.
pub fn insert_record(conn: &Connection, record: &HistoryRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO task_history
            (task_id, task_type, worker_id, tau_seconds, actual_runtime, sla_success,
             arrival_time, deadline, req_cpu, req_mem_mb, req_storage_mb, req_gpu,
             worker_load, avail_cpu, avail_mem_mb, avail_storage_mb, avail_gpu)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
        params![
            record.task_id,
            record.task_type,
            record.worker_id,
            record.tau_seconds,
            record.actual_runtime,
            record.sla_success as i64,
            record.arrival_time as i64,
            record.deadline.map(|v| v as i64),
            record.request.cpu,
            record.request.mem_mb,
            record.request.storage_mb,
            record.request.gpu,
            record.worker_load,
            record.available_at_assign.cpu,
            record.available_at_assign.mem_mb,
            record.available_at_assign.storage_mb,
            record.available_at_assign.gpu,
        ],
    )
    .with_context(|| format!("Failed to insert history record for task {}", record.task_id))?;
    Ok(())
}

/// Load records recorded at or after `since`, oldest first.
pub fn fetch_window(conn: &Connection, since: u64) -> Result<Vec<HistoryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM task_history WHERE recorded_at >= ?1 ORDER BY recorded_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![since as i64], row_to_record)?;
    let mut records = Vec::new();
    for record in rows {
        records.push(record?);
    }
    Ok(records)
}

/// Number of records inside the window.
pub fn count_window(conn: &Connection, since: u64) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM task_history WHERE recorded_at >= ?1",
        params![since as i64],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Delete records older than the retention cutoff.
pub(super) fn cleanup_old_data(conn: &Connection, cutoff: i64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM task_history WHERE recorded_at < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
