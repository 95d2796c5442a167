//! Schema versioning for the checkpoint database.
//!
//! Migrations are applied incrementally on open and are idempotent: a
//! database already at the current version is left untouched.

use rusqlite::Connection;

use crate::{klog, klog_debug, Result};

/// Current schema version of the checkpoint database.
pub const SCHEMA_VERSION: i32 = 1;

/// Read the schema version recorded in the database (0 for a fresh file).
pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Bring the database schema up to [`SCHEMA_VERSION`].
///
/// Returns `true` if any migration ran.
pub fn run_migrations(conn: &Connection) -> Result<bool> {
    let current = schema_version(conn)?;
    klog_debug!("checkpoint schema at version {}", current);

    if current >= SCHEMA_VERSION {
        return Ok(false);
    }

    if current < 1 {
        migrate_v1(conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            [1],
        )?;
    }

    klog!("checkpoint schema migrated {} -> {}", current, SCHEMA_VERSION);
    Ok(true)
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    // task_id uniqueness is what keeps one checkpoint per task.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL UNIQUE,
            token TEXT NOT NULL,
            data BLOB NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_created_at
            ON checkpoints(created_at);
        "#,
    )?;
    Ok(())
}
