//! Database management for the master coordinator
//!
//! This module handles SQLite database operations for the durable collections:
//! tasks, workers, assignments, results, task history, worker stats, artifact
//! file metadata, and users. SQLite is chosen for its simplicity and ease of
//! deployment, making the master self-contained. The in-memory registry is
//! the hot path; every write here is the durable mirror.

// Collection-specific database modules
pub mod db_assignments;
pub mod db_files;
pub mod db_history;
pub mod db_results;
pub mod db_tasks;
pub mod db_users;
pub mod db_worker_stats;
pub mod db_workers;

pub use db_assignments::AssignmentRecord;
pub use db_history::HistoryRecord;
pub use db_results::StoredResult;
pub use db_worker_stats::{WorkerStatsSample, WorkerStatsWindow};
pub use db_workers::WorkerRow;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The default name for the master's database file.
const DATABASE_FILE: &str = "master_state.db";

/// Manages the SQLite database for the master.
/// This struct encapsulates the database connection and all related operations,
/// providing a clean, high-level API to the rest of the master application.
pub struct MasterDatabase {
    /// The path to the SQLite database file.
    db_path: PathBuf,
    /// The active database connection. It's an `Option` to allow for lazy
    /// initialization and handling of connection state.
    connection: Option<Connection>,
    /// Busy timeout applied to every connection.
    busy_timeout: std::time::Duration,
}

impl MasterDatabase {
    /// Creates a new `MasterDatabase` manager.
    /// It ensures that the directory for the database file exists.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        let db_path = data_dir.join(DATABASE_FILE);

        Ok(Self {
            db_path,
            connection: None,
            busy_timeout: std::time::Duration::from_secs(busy_timeout_seconds),
        })
    }

    /// Initializes the database by creating tables and indexes if they don't exist.
    /// This method is idempotent and safe to call on every master startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing master database at {}", self.db_path.display());

        let conn = self.get_connection()?;

        db_tasks::create_table(conn)?;
        db_workers::create_table(conn)?;
        db_assignments::create_table(conn)?;
        db_results::create_table(conn)?;
        db_history::create_table(conn)?;
        db_worker_stats::create_table(conn)?;
        db_files::create_table(conn)?;
        db_users::create_table(conn)?;

        info!("Master database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection, creating it if needed.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode is good for concurrency.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            // Checkpoint automatically when WAL reaches 1000 pages (~4MB).
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign key constraints")?;

            // Every store call carries this deadline; nothing waits on a
            // locked database longer than the configured timeout.
            conn.busy_timeout(self.busy_timeout)
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self
            .connection
            .as_mut()
            .expect("Database connection should exist after initialization in get_connection()"))
    }

    /// Deletes results, history, stats samples, and file metadata older than
    /// the retention period. Task and worker rows are kept; they are the
    /// registry's durable mirror.
    pub async fn cleanup_old_data(&mut self, retention_days: u32) -> Result<usize> {
        let cutoff =
            shared::utils::current_timestamp() as i64 - (retention_days as i64) * 86_400;
        let conn = self.get_connection()?;

        let mut total = 0usize;
        total += db_results::cleanup_old_data(conn, cutoff)?;
        total += db_history::cleanup_old_data(conn, cutoff)?;
        total += db_worker_stats::cleanup_old_data(conn, cutoff)?;
        total += db_files::cleanup_old_data(conn, cutoff)?;
        total += db_tasks::cleanup_old_terminal_tasks(conn, cutoff)?;

        debug!("Cleanup removed {} expired rows", total);
        Ok(total)
    }

    /// Runs a manual WAL checkpoint, returning the number of checkpointed frames.
    pub async fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let frames: i64 = conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| row.get(1),
        )?;
        Ok(frames)
    }

    /// Closes the database connection.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Failed to close database cleanly: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        db.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_on_empty_database() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        let removed = db.cleanup_old_data(30).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_wal() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().await.unwrap();
        assert!(db.checkpoint_wal().await.is_ok());
    }
}
