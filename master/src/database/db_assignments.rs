//! Assignment collection operations for the master
//!
//! One row per dispatched task; unique by task_id. The assignment is the
//! authoritative back-pointer from a task to the worker that owns it, and it
//! captures the worker's load and availability at reservation time for the
//! trainer's history records.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::task::ResourceRequest;

/// A persisted assignment
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRecord {
    pub task_id: String,
    pub worker_id: String,
    pub assigned_at: u64,
    /// Normalized load of the worker when the reservation was made
    pub worker_load: f64,
    /// Worker availability just before the reservation
    pub available_at_assign: ResourceRequest,
}

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS assignments (
            task_id TEXT PRIMARY KEY,
            worker_id TEXT NOT NULL,
            assigned_at INTEGER NOT NULL,
            worker_load REAL NOT NULL DEFAULT 0,
            avail_cpu REAL NOT NULL DEFAULT 0,
            avail_mem_mb REAL NOT NULL DEFAULT 0,
            avail_storage_mb REAL NOT NULL DEFAULT 0,
            avail_gpu REAL NOT NULL DEFAULT 0
        )
        "#,
        [],
    )
    .context("Failed to create assignments table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_worker ON assignments(worker_id)",
        [],
    )?;

    Ok(())
}

fn row_to_assignment(row: &Row) -> rusqlite::Result<AssignmentRecord> {
    Ok(AssignmentRecord {
        task_id: row.get("task_id")?,
        worker_id: row.get("worker_id")?,
        assigned_at: row.get::<_, i64>("assigned_at")? as u64,
        worker_load: row.get("worker_load")?,
        available_at_assign: ResourceRequest {
            cpu: row.get("avail_cpu")?,
            mem_mb: row.get("avail_mem_mb")?,
            storage_mb: row.get("avail_storage_mb")?,
            gpu: row.get("avail_gpu")?,
        },
    })
}

/// Record an assignment. Fails if the task already has one.
pub fn insert_assignment(conn: &Connection, record: &AssignmentRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO assignments (task_id, worker_id, assigned_at, worker_load,
                                 avail_cpu, avail_mem_mb, avail_storage_mb, avail_gpu)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            record.task_id,
            record.worker_id,
            record.assigned_at as i64,
            record.worker_load,
            record.available_at_assign.cpu,
            record.available_at_assign.mem_mb,
            record.available_at_assign.storage_mb,
            record.available_at_assign.gpu,
        ],
    )
    .with_context(|| format!("Failed to insert assignment for task {}", record.task_id))?;
    Ok(())
}

/// Fetch the assignment for a task, if any.
pub fn get_assignment(conn: &Connection, task_id: &str) -> Result<Option<AssignmentRecord>> {
    conn.query_row(
        "SELECT * FROM assignments WHERE task_id = ?1",
        params![task_id],
        row_to_assignment,
    )
    .optional()
    .with_context(|| format!("Failed to load assignment for task {}", task_id))
}

/// Remove the assignment for a task (dispatch rollback).
pub fn delete_assignment(conn: &Connection, task_id: &str) -> Result<usize> {
    let deleted = conn
        .execute(
            "DELETE FROM assignments WHERE task_id = ?1",
            params![task_id],
        )
        .with_context(|| format!("Failed to delete assignment for task {}", task_id))?;
    Ok(deleted)
}

/// Load the assignments currently pointing at a worker.
pub fn load_for_worker(conn: &Connection, worker_id: &str) -> Result<Vec<AssignmentRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM assignments WHERE worker_id = ?1")?;
    let rows = stmt.query_map(params![worker_id], row_to_assignment)?;
    let mut records = Vec::new();
    for record in rows {
        records.push(record?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MasterDatabase;
    use tempfile::TempDir;

    fn sample(task_id: &str, worker_id: &str) -> AssignmentRecord {
        AssignmentRecord {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            assigned_at: 2_000,
            worker_load: 0.25,
            available_at_assign: ResourceRequest::new(4.0, 8_192.0, 100_000.0, 1.0),
        }
    }

    #[tokio::test]
    async fn test_unique_by_task_id() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let conn = db.get_connection().unwrap();

        insert_assignment(conn, &sample("t1", "w1")).unwrap();
        // A second assignment for the same task must be rejected
        assert!(insert_assignment(conn, &sample("t1", "w2")).is_err());

        let loaded = get_assignment(conn, "t1").unwrap().unwrap();
        assert_eq!(loaded.worker_id, "w1");
        assert_eq!(loaded.worker_load, 0.25);
    }

    #[tokio::test]
    async fn test_delete_and_load_for_worker() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let conn = db.get_connection().unwrap();

        insert_assignment(conn, &sample("t1", "w1")).unwrap();
        insert_assignment(conn, &sample("t2", "w1")).unwrap();
        insert_assignment(conn, &sample("t3", "w2")).unwrap();

        assert_eq!(load_for_worker(conn, "w1").unwrap().len(), 2);
        assert_eq!(delete_assignment(conn, "t1").unwrap(), 1);
        assert_eq!(delete_assignment(conn, "t1").unwrap(), 0);
        assert_eq!(load_for_worker(conn, "w1").unwrap().len(), 1);
    }
}
