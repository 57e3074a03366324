//! User collection operations for the master
//!
//! Minimal user tracking: every submitter is recorded on first contact.
//! Administrative rights come from the master configuration; the flag here
//! only mirrors it for reporting.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// A known user
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub user_id: String,
    pub is_admin: bool,
    pub tasks_submitted: u64,
}

pub(super) fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            is_admin INTEGER NOT NULL DEFAULT 0,
            tasks_submitted INTEGER NOT NULL DEFAULT 0,
            first_seen INTEGER DEFAULT (strftime('%s', 'now')),
            last_seen INTEGER DEFAULT (strftime('%s', 'now'))
        )
        "#,
        [],
    )
    .context("Failed to create users table")?;
    Ok(())
}

/// Record a submission from a user, creating the row on first contact.
pub fn record_submission(conn: &Connection, user_id: &str, is_admin: bool) -> Result<()> {
    let now = shared::utils::current_timestamp() as i64;
    conn.execute(
        r#"
        INSERT INTO users (user_id, is_admin, tasks_submitted, first_seen, last_seen)
        VALUES (?1, ?2, 1, ?3, ?3)
        ON CONFLICT(user_id) DO UPDATE SET
            is_admin = excluded.is_admin,
            tasks_submitted = tasks_submitted + 1,
            last_seen = excluded.last_seen
        "#,
        params![user_id, is_admin as i64, now],
    )
    .with_context(|| format!("Failed to record submission for user {}", user_id))?;
    Ok(())
}

/// Fetch a user record.
pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserRecord>> {
    conn.query_row(
        "SELECT user_id, is_admin, tasks_submitted FROM users WHERE user_id = ?1",
        params![user_id],
        |row| {
            Ok(UserRecord {
                user_id: row.get(0)?,
                is_admin: row.get::<_, i64>(1)? != 0,
                tasks_submitted: row.get::<_, i64>(2)? as u64,
            })
        },
    )
    .optional()
    .with_context(|| format!("Failed to load user {}", user_id))
}
