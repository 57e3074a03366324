//! Artifact file metadata operations for the master
//!
//! One row per committed output file. The bytes live in the artifact store on
//! disk; this table is the queryable index.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

/// Metadata of one committed artifact file
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ArtifactFileRecord {
    pub task_id: String,
    pub user_id: String,
    pub relative_path: String,
    pub size_bytes: u64,
    pub checksum: String,
}

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS artifact_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            stored_at INTEGER DEFAULT (strftime('%s', 'now')),
            UNIQUE(task_id, relative_path)
        )
        "#,
        [],
    )
    .context("Failed to create artifact_files table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_files_task ON artifact_files(task_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_files_user ON artifact_files(user_id)",
        [],
    )?;

    Ok(())
}

fn row_to_record(row: &Row) -> rusqlite::Result<ArtifactFileRecord> {
    Ok(ArtifactFileRecord {
        task_id: row.get("task_id")?,
        user_id: row.get("user_id")?,
        relative_path: row.get("relative_path")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        checksum: row.get("checksum")?,
    })
}

/// Record a committed file. Re-commits of the same path update in place.
pub fn upsert_file(conn: &Connection, record: &ArtifactFileRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO artifact_files (task_id, user_id, relative_path, size_bytes, checksum)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(task_id, relative_path) DO UPDATE SET
            size_bytes = excluded.size_bytes,
            checksum = excluded.checksum
        "#,
        params![
            record.task_id,
            record.user_id,
            record.relative_path,
            record.size_bytes as i64,
            record.checksum,
        ],
    )
    .with_context(|| {
        format!(
            "Failed to upsert artifact file {}/{}",
            record.task_id, record.relative_path
        )
    })?;
    Ok(())
}

/// List the committed files of a task.
pub fn list_by_task(conn: &Connection, task_id: &str) -> Result<Vec<ArtifactFileRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM artifact_files WHERE task_id = ?1 ORDER BY relative_path ASC",
    )?;
    let rows = stmt.query_map(params![task_id], row_to_record)?;
    let mut records = Vec::new();
    for record in rows {
        records.push(record?);
    }
    Ok(records)
}

/// Delete metadata older than the retention cutoff.
pub(super) fn cleanup_old_data(conn: &Connection, cutoff: i64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM artifact_files WHERE stored_at < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
