//! Task collection operations for the master
//!
//! Stores the immutable submission fields and the mutable lifecycle fields of
//! every task. The status column is the authoritative durable status; the
//! ingestor and cancellation path read it before every mutation.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::task::{ResourceRequest, Task, TaskStatus, TaskType};

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            task_name TEXT NOT NULL,
            image TEXT NOT NULL,
            command TEXT NOT NULL,
            req_cpu REAL NOT NULL,
            req_mem_mb REAL NOT NULL,
            req_storage_mb REAL NOT NULL,
            req_gpu REAL NOT NULL,
            task_type TEXT NOT NULL,
            tau_seconds REAL,
            sla_multiplier REAL NOT NULL,
            submitted_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER,
            completed_at INTEGER
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_submitted ON tasks(submitted_at)",
        [],
    )?;

    Ok(())
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let command_json: String = row.get("command")?;
    let command: Vec<String> = serde_json::from_str(&command_json).unwrap_or_default();
    let task_type_str: String = row.get("task_type")?;
    let task_type: TaskType =
        serde_json::from_str(&format!("\"{}\"", task_type_str)).unwrap_or(TaskType::Mixed);
    let status_str: String = row.get("status")?;

    Ok(Task {
        task_id: row.get("task_id")?,
        user_id: row.get("user_id")?,
        task_name: row.get("task_name")?,
        image: row.get("image")?,
        command,
        request: ResourceRequest {
            cpu: row.get("req_cpu")?,
            mem_mb: row.get("req_mem_mb")?,
            storage_mb: row.get("req_storage_mb")?,
            gpu: row.get("req_gpu")?,
        },
        task_type,
        tau_seconds: row.get("tau_seconds")?,
        sla_multiplier: row.get("sla_multiplier")?,
        submitted_at: row.get::<_, i64>("submitted_at")? as u64,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
        started_at: row.get::<_, Option<i64>>("started_at")?.map(|v| v as u64),
        completed_at: row.get::<_, Option<i64>>("completed_at")?.map(|v| v as u64),
    })
}

/// Insert a new task record; the task_id must be unused.
pub fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    let command_json = serde_json::to_string(&task.command)?;
    conn.execute(
        r#"
        INSERT INTO tasks (task_id, user_id, task_name, image, command,
                           req_cpu, req_mem_mb, req_storage_mb, req_gpu,
                           task_type, tau_seconds, sla_multiplier, submitted_at,
                           status, started_at, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
        params![
            task.task_id,
            task.user_id,
            task.task_name,
            task.image,
            command_json,
            task.request.cpu,
            task.request.mem_mb,
            task.request.storage_mb,
            task.request.gpu,
            task.task_type.as_str(),
            task.tau_seconds,
            task.sla_multiplier,
            task.submitted_at as i64,
            task.status.as_str(),
            task.started_at.map(|v| v as i64),
            task.completed_at.map(|v| v as i64),
        ],
    )
    .with_context(|| format!("Failed to insert task {}", task.task_id))?;
    Ok(())
}

/// Fetch a single task by ID.
pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    conn.query_row(
        "SELECT * FROM tasks WHERE task_id = ?1",
        params![task_id],
        row_to_task,
    )
    .optional()
    .with_context(|| format!("Failed to load task {}", task_id))
}

/// Update the lifecycle fields of a task.
pub fn update_status(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
    started_at: Option<u64>,
    completed_at: Option<u64>,
) -> Result<usize> {
    let updated = conn
        .execute(
            r#"
            UPDATE tasks
            SET status = ?1,
                started_at = COALESCE(?2, started_at),
                completed_at = COALESCE(?3, completed_at)
            WHERE task_id = ?4
            "#,
            params![
                status.as_str(),
                started_at.map(|v| v as i64),
                completed_at.map(|v| v as i64),
                task_id,
            ],
        )
        .with_context(|| format!("Failed to update status of task {}", task_id))?;
    Ok(updated)
}

/// Load every task currently in one of the given states, oldest first.
pub fn load_tasks_by_status(conn: &Connection, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
    let placeholders = statuses
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT * FROM tasks WHERE status IN ({}) ORDER BY submitted_at ASC, task_id ASC",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let status_strs: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    let rows = stmt.query_map(rusqlite::params_from_iter(status_strs), row_to_task)?;

    let mut tasks = Vec::new();
    for task in rows {
        tasks.push(task?);
    }
    Ok(tasks)
}

/// Remove terminal tasks whose completion fell behind the retention cutoff.
pub(super) fn cleanup_old_terminal_tasks(conn: &Connection, cutoff: i64) -> Result<usize> {
    let deleted = conn.execute(
        r#"
        DELETE FROM tasks
        WHERE status IN ('completed', 'failed', 'cancelled')
          AND completed_at IS NOT NULL
          AND completed_at < ?1
        "#,
        params![cutoff],
    )?;
    Ok(deleted)
}
