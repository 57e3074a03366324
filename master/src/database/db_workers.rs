//! Worker registry collection operations for the master
//!
//! The durable mirror of the in-memory worker registry. Liveness is primarily
//! in-memory; `last_heartbeat` here is persisted best-effort so a restarted
//! master can show when a worker was last seen.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::task::ResourceRequest;

/// A persisted worker row as loaded at master startup
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRow {
    pub worker_id: String,
    pub address: String,
    pub total: ResourceRequest,
    pub allocated: ResourceRequest,
    pub last_heartbeat: u64,
    pub registered_at: u64,
}

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            worker_id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            total_cpu REAL NOT NULL DEFAULT 0,
            total_mem_mb REAL NOT NULL DEFAULT 0,
            total_storage_mb REAL NOT NULL DEFAULT 0,
            total_gpu REAL NOT NULL DEFAULT 0,
            allocated_cpu REAL NOT NULL DEFAULT 0,
            allocated_mem_mb REAL NOT NULL DEFAULT 0,
            allocated_storage_mb REAL NOT NULL DEFAULT 0,
            allocated_gpu REAL NOT NULL DEFAULT 0,
            last_heartbeat INTEGER NOT NULL DEFAULT 0,
            registered_at INTEGER DEFAULT (strftime('%s', 'now'))
        )
        "#,
        [],
    )
    .context("Failed to create workers table")?;

    Ok(())
}

fn row_to_worker(row: &Row) -> rusqlite::Result<WorkerRow> {
    Ok(WorkerRow {
        worker_id: row.get("worker_id")?,
        address: row.get("address")?,
        total: ResourceRequest {
            cpu: row.get("total_cpu")?,
            mem_mb: row.get("total_mem_mb")?,
            storage_mb: row.get("total_storage_mb")?,
            gpu: row.get("total_gpu")?,
        },
        allocated: ResourceRequest {
            cpu: row.get("allocated_cpu")?,
            mem_mb: row.get("allocated_mem_mb")?,
            storage_mb: row.get("allocated_storage_mb")?,
            gpu: row.get("allocated_gpu")?,
        },
        last_heartbeat: row.get::<_, i64>("last_heartbeat")? as u64,
        registered_at: row.get::<_, i64>("registered_at")? as u64,
    })
}

/// Insert or update a worker's durable mirror.
pub fn upsert_worker(
    conn: &Connection,
    worker_id: &str,
    address: &str,
    total: &ResourceRequest,
    allocated: &ResourceRequest,
    last_heartbeat: u64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO workers (worker_id, address, total_cpu, total_mem_mb, total_storage_mb, total_gpu,
                             allocated_cpu, allocated_mem_mb, allocated_storage_mb, allocated_gpu, last_heartbeat)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(worker_id) DO UPDATE SET
            address = excluded.address,
            total_cpu = excluded.total_cpu,
            total_mem_mb = excluded.total_mem_mb,
            total_storage_mb = excluded.total_storage_mb,
            total_gpu = excluded.total_gpu,
            allocated_cpu = excluded.allocated_cpu,
            allocated_mem_mb = excluded.allocated_mem_mb,
            allocated_storage_mb = excluded.allocated_storage_mb,
            allocated_gpu = excluded.allocated_gpu,
            last_heartbeat = excluded.last_heartbeat
        "#,
        params![
            worker_id,
            address,
            total.cpu,
            total.mem_mb,
            total.storage_mb,
            total.gpu,
            allocated.cpu,
            allocated.mem_mb,
            allocated.storage_mb,
            allocated.gpu,
            last_heartbeat as i64,
        ],
    )
    .with_context(|| format!("Failed to upsert worker {}", worker_id))?;
    Ok(())
}

/// Fetch a single worker row.
pub fn get_worker(conn: &Connection, worker_id: &str) -> Result<Option<WorkerRow>> {
    conn.query_row(
        "SELECT * FROM workers WHERE worker_id = ?1",
        params![worker_id],
        row_to_worker,
    )
    .optional()
    .with_context(|| format!("Failed to load worker {}", worker_id))
}

/// Load every persisted worker. Used once at startup; every worker loads as
/// inactive until it heartbeats again.
pub fn load_all(conn: &Connection) -> Result<Vec<WorkerRow>> {
    let mut stmt = conn.prepare("SELECT * FROM workers ORDER BY worker_id ASC")?;
    let rows = stmt.query_map([], row_to_worker)?;
    let mut workers = Vec::new();
    for worker in rows {
        workers.push(worker?);
    }
    Ok(workers)
}

/// Remove a worker's durable mirror.
pub fn delete_worker(conn: &Connection, worker_id: &str) -> Result<usize> {
    let deleted = conn
        .execute("DELETE FROM workers WHERE worker_id = ?1", params![worker_id])
        .with_context(|| format!("Failed to delete worker {}", worker_id))?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MasterDatabase;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upsert_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let conn = db.get_connection().unwrap();

        let total = ResourceRequest::new(8.0, 16_384.0, 500_000.0, 0.0);
        let allocated = ResourceRequest::new(1.0, 512.0, 1_024.0, 0.0);
        upsert_worker(conn, "w1", "10.0.0.1:7070", &total, &allocated, 1_234).unwrap();

        let row = get_worker(conn, "w1").unwrap().unwrap();
        assert_eq!(row.total, total);
        assert_eq!(row.allocated, allocated);
        assert_eq!(row.last_heartbeat, 1_234);

        // Upsert updates in place
        upsert_worker(
            conn,
            "w1",
            "10.0.0.2:7070",
            &total,
            &ResourceRequest::default(),
            2_000,
        )
        .unwrap();
        let row = get_worker(conn, "w1").unwrap().unwrap();
        assert_eq!(row.address, "10.0.0.2:7070");
        assert!(row.allocated.is_zero());

        assert_eq!(load_all(conn).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_worker() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let conn = db.get_connection().unwrap();

        upsert_worker(
            conn,
            "w1",
            "10.0.0.1:7070",
            &ResourceRequest::default(),
            &ResourceRequest::default(),
            0,
        )
        .unwrap();
        assert_eq!(delete_worker(conn, "w1").unwrap(), 1);
        assert_eq!(delete_worker(conn, "w1").unwrap(), 0);
        assert!(get_worker(conn, "w1").unwrap().is_none());
    }
}
