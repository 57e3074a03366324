//! Result collection operations for the master
//!
//! At most one result row ever exists per task. The ingestor checks before
//! writing and the INSERT OR IGNORE on the primary key backs the same
//! invariant at the storage layer, so duplicate reports can never produce a
//! second row no matter how they race.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::task::TaskStatus;

/// A persisted terminal result
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredResult {
    pub task_id: String,
    pub worker_id: String,
    pub status: TaskStatus,
    pub logs: String,
    pub output_files: Vec<String>,
    pub sla_success: bool,
    pub completed_at: u64,
    pub received_at: u64,
}

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            task_id TEXT PRIMARY KEY,
            worker_id TEXT NOT NULL,
            status TEXT NOT NULL,
            logs TEXT NOT NULL,
            output_files TEXT NOT NULL,
            sla_success INTEGER NOT NULL,
            completed_at INTEGER NOT NULL,
            received_at INTEGER DEFAULT (strftime('%s', 'now'))
        )
        "#,
        [],
    )
    .context("Failed to create results table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_worker ON results(worker_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_completed ON results(completed_at)",
        [],
    )?;

    Ok(())
}

fn row_to_result(row: &Row) -> rusqlite::Result<StoredResult> {
    let status_str: String = row.get("status")?;
    let files_json: String = row.get("output_files")?;
    Ok(StoredResult {
        task_id: row.get("task_id")?,
        worker_id: row.get("worker_id")?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        logs: row.get("logs")?,
        output_files: serde_json::from_str(&files_json).unwrap_or_default(),
        sla_success: row.get::<_, i64>("sla_success")? != 0,
        completed_at: row.get::<_, i64>("completed_at")? as u64,
        received_at: row.get::<_, i64>("received_at")? as u64,
    })
}

/// Insert a result unless one already exists. Returns true when the row was
/// written, false when an earlier result made this a duplicate.
pub fn insert_if_absent(conn: &Connection, result: &StoredResult) -> Result<bool> {
    let files_json = serde_json::to_string(&result.output_files)?;
    let inserted = conn
        .execute(
            r#"
            INSERT OR IGNORE INTO results
                (task_id, worker_id, status, logs, output_files, sla_success, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                result.task_id,
                result.worker_id,
                result.status.as_str(),
                result.logs,
                files_json,
                result.sla_success as i64,
                result.completed_at as i64,
            ],
        )
        .with_context(|| format!("Failed to insert result for task {}", result.task_id))?;
    Ok(inserted > 0)
}

/// Whether a result already exists for the task.
pub fn exists(conn: &Connection, task_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM results WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Fetch the result for a task, if any.
pub fn get_result(conn: &Connection, task_id: &str) -> Result<Option<StoredResult>> {
    conn.query_row(
        "SELECT * FROM results WHERE task_id = ?1",
        params![task_id],
        row_to_result,
    )
    .optional()
    .with_context(|| format!("Failed to load result for task {}", task_id))
}

/// Delete results older than the retention cutoff.
pub(super) fn cleanup_old_data(conn: &Connection, cutoff: i64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM results WHERE completed_at < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MasterDatabase;
    use tempfile::TempDir;

    fn sample(task_id: &str, status: TaskStatus) -> StoredResult {
        StoredResult {
            task_id: task_id.to_string(),
            worker_id: "w1".to_string(),
            status,
            logs: "ok\n".to_string(),
            output_files: vec!["out/result.txt".to_string()],
            sla_success: true,
            completed_at: 3_000,
            received_at: 0,
        }
    }

    #[tokio::test]
    async fn test_single_result_invariant() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let conn = db.get_connection().unwrap();

        assert!(!exists(conn, "t1").unwrap());
        assert!(insert_if_absent(conn, &sample("t1", TaskStatus::Completed)).unwrap());
        assert!(exists(conn, "t1").unwrap());

        // A second write is ignored and the original row survives untouched
        let mut second = sample("t1", TaskStatus::Failed);
        second.logs = "crashed\n".to_string();
        assert!(!insert_if_absent(conn, &second).unwrap());

        let stored = get_result(conn, "t1").unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.logs, "ok\n");
    }

    #[tokio::test]
    async fn test_result_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let conn = db.get_connection().unwrap();

        insert_if_absent(conn, &sample("t2", TaskStatus::Cancelled)).unwrap();
        let stored = get_result(conn, "t2").unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.output_files, vec!["out/result.txt".to_string()]);
        assert!(stored.sla_success);
    }
}
