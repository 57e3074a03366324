//! Worker stats collection operations for the master
//!
//! The telemetry hub appends one sample row per processed heartbeat: the
//! fraction-seconds of each resource used since the previous heartbeat and
//! whether the worker was overloaded during the interval. The trainer reads
//! the window as per-worker aggregates.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

/// One heartbeat-interval usage sample
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatsSample {
    pub worker_id: String,
    pub sample_time: u64,
    /// Seconds covered by this sample
    pub interval_seconds: f64,
    /// usage_fraction * interval for each resource
    pub cpu_seconds: f64,
    pub mem_seconds: f64,
    pub gpu_seconds: f64,
    /// Interval seconds spent above the overload threshold
    pub overload_seconds: f64,
}

/// Per-worker aggregate over a query window
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatsWindow {
    pub worker_id: String,
    pub cpu_seconds: f64,
    pub mem_seconds: f64,
    pub gpu_seconds: f64,
    pub overload_seconds: f64,
    pub total_seconds: f64,
}

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS worker_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_id TEXT NOT NULL,
            sample_time INTEGER NOT NULL,
            interval_seconds REAL NOT NULL,
            cpu_seconds REAL NOT NULL,
            mem_seconds REAL NOT NULL,
            gpu_seconds REAL NOT NULL,
            overload_seconds REAL NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create worker_stats table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stats_worker_time ON worker_stats(worker_id, sample_time)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stats_time ON worker_stats(sample_time)",
        [],
    )?;

    Ok(())
}

/// Append a usage sample.
pub fn insert_sample(conn: &Connection, sample: &WorkerStatsSample) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO worker_stats
            (worker_id, sample_time, interval_seconds, cpu_seconds, mem_seconds, gpu_seconds, overload_seconds)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            sample.worker_id,
            sample.sample_time as i64,
            sample.interval_seconds,
            sample.cpu_seconds,
            sample.mem_seconds,
            sample.gpu_seconds,
            sample.overload_seconds,
        ],
    )
    .with_context(|| format!("Failed to insert stats sample for worker {}", sample.worker_id))?;
    Ok(())
}

fn row_to_window(row: &Row) -> rusqlite::Result<WorkerStatsWindow> {
    Ok(WorkerStatsWindow {
        worker_id: row.get(0)?,
        cpu_seconds: row.get(1)?,
        mem_seconds: row.get(2)?,
        gpu_seconds: row.get(3)?,
        overload_seconds: row.get(4)?,
        total_seconds: row.get(5)?,
    })
}

/// Aggregate samples at or after `since` per worker.
pub fn aggregate_window(conn: &Connection, since: u64) -> Result<Vec<WorkerStatsWindow>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT worker_id,
               SUM(cpu_seconds),
               SUM(mem_seconds),
               SUM(gpu_seconds),
               SUM(overload_seconds),
               SUM(interval_seconds)
        FROM worker_stats
        WHERE sample_time >= ?1
        GROUP BY worker_id
        ORDER BY worker_id ASC
        "#,
    )?;
    let rows = stmt.query_map(params![since as i64], row_to_window)?;
    let mut windows = Vec::new();
    for window in rows {
        windows.push(window?);
    }
    Ok(windows)
}

/// Delete samples older than the retention cutoff.
pub(super) fn cleanup_old_data(conn: &Connection, cutoff: i64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM worker_stats WHERE sample_time < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
