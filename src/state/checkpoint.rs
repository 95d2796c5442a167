//! Durable per-task checkpoints backed by SQLite.
//!
//! A task has at most one live checkpoint. Saving again for the same task
//! replaces token, data, size and timestamp in a single upsert; the unique
//! constraint on `task_id` is what enforces this, not application locking.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ActiveTaskQuery;
use crate::{klog_debug, klog_error, Error, Result};

use super::migration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CheckpointId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A stored checkpoint. `data` is the serialized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub task_id: String,
    pub token: String,
    pub data: Vec<u8>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Deserialize the payload back into the type that was saved.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub total: u64,
    pub total_size_bytes: u64,
    pub avg_size_bytes: f64,
}

/// SQLite-backed checkpoint store. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        klog_debug!("CheckpointStore::open path={}", path.display());
        let conn = Connection::open(path).inspect_err(|e| {
            klog_error!("failed to open checkpoint db {}: {}", path.display(), e);
        })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migration::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::StorageLock(e.to_string()))
    }

    /// Save (insert or replace) the checkpoint for `task_id`.
    ///
    /// The returned id is stable across re-saves of the same task.
    pub fn save<T: Serialize + ?Sized>(
        &self,
        task_id: &str,
        token: &str,
        data: &T,
    ) -> Result<CheckpointId> {
        self.save_with_timestamp(task_id, token, data, Utc::now())
    }

    pub(crate) fn save_with_timestamp<T: Serialize + ?Sized>(
        &self,
        task_id: &str,
        token: &str,
        data: &T,
        created_at: DateTime<Utc>,
    ) -> Result<CheckpointId> {
        let bytes = serde_json::to_vec(data)?;
        let size = bytes.len() as i64;
        let conn = self.lock()?;

        let id: String = conn
            .query_row(
                r#"
                INSERT INTO checkpoints (id, task_id, token, data, size_bytes, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(task_id) DO UPDATE SET
                    token = excluded.token,
                    data = excluded.data,
                    size_bytes = excluded.size_bytes,
                    created_at = excluded.created_at
                RETURNING id
                "#,
                params![
                    CheckpointId::new().to_string(),
                    task_id,
                    token,
                    bytes,
                    size,
                    format_timestamp(created_at),
                ],
                |row| row.get(0),
            )
            .inspect_err(|e| klog_error!("checkpoint save failed for {}: {}", task_id, e))?;

        klog_debug!("saved checkpoint for {} ({} bytes)", task_id, size);
        parse_id(&id)
    }

    pub fn load(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, task_id, token, data, size_bytes, created_at \
                 FROM checkpoints WHERE task_id = ?1",
                params![task_id],
                row_to_raw,
            )
            .optional()
            .inspect_err(|e| klog_error!("checkpoint load failed for {}: {}", task_id, e))?;
        row.map(RawCheckpoint::into_checkpoint).transpose()
    }

    /// Delete the checkpoint for `task_id`. Absent checkpoints are not an error.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])
            .inspect_err(|e| klog_error!("checkpoint delete failed for {}: {}", task_id, e))?;
        if n > 0 {
            klog_debug!("deleted checkpoint for {}", task_id);
        }
        Ok(n > 0)
    }

    /// All checkpoints, newest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, token, data, size_bytes, created_at \
             FROM checkpoints ORDER BY created_at DESC, task_id",
        )?;
        let rows = stmt.query_map([], row_to_raw)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_checkpoint()?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<CheckpointStats> {
        let conn = self.lock()?;
        let (total, total_size): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM checkpoints",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let avg = if total > 0 {
            total_size as f64 / total as f64
        } else {
            0.0
        };
        Ok(CheckpointStats {
            total: total as u64,
            total_size_bytes: total_size as u64,
            avg_size_bytes: avg,
        })
    }

    /// Delete checkpoints older than `days_to_keep` days, skipping tasks the
    /// query still reports as active. Returns how many were deleted.
    pub fn cleanup(&self, days_to_keep: u32, active: &dyn ActiveTaskQuery) -> Result<usize> {
        // A retention reaching past the earliest representable date keeps everything.
        let Some(cutoff) = TimeDelta::try_days(i64::from(days_to_keep))
            .and_then(|keep| Utc::now().checked_sub_signed(keep))
        else {
            klog_debug!("Checkpoint cleanup: retention of {} days keeps everything", days_to_keep);
            return Ok(0);
        };
        let cutoff = format_timestamp(cutoff);
        let active_ids = active.active_task_ids();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let candidates: Vec<String> = {
            let mut stmt = tx.prepare("SELECT task_id FROM checkpoints WHERE created_at < ?1")?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut deleted = 0;
        for task_id in candidates {
            if active_ids.contains(&task_id) {
                klog_debug!("cleanup: keeping checkpoint of active task {}", task_id);
                continue;
            }
            deleted += tx.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])?;
        }
        tx.commit()
            .inspect_err(|e| klog_error!("checkpoint cleanup failed: {}", e))?;

        klog_debug!(
            "cleanup: deleted {} checkpoints older than {} days",
            deleted,
            days_to_keep
        );
        Ok(deleted)
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

struct RawCheckpoint {
    id: String,
    task_id: String,
    token: String,
    data: Vec<u8>,
    size_bytes: i64,
    created_at: String,
}

impl RawCheckpoint {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| Error::Validation(format!("bad checkpoint timestamp: {}", e)))?
            .with_timezone(&Utc);
        Ok(Checkpoint {
            id: parse_id(&self.id)?,
            task_id: self.task_id,
            token: self.token,
            data: self.data,
            size_bytes: self.size_bytes.max(0) as u64,
            created_at,
        })
    }
}

fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        id: row.get(0)?,
        task_id: row.get(1)?,
        token: row.get(2)?,
        data: row.get(3)?,
        size_bytes: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn parse_id(s: &str) -> Result<CheckpointId> {
    s.parse()
        .map_err(|e| Error::Validation(format!("bad checkpoint id {}: {}", s, e)))
}

// Fixed width so lexical order in SQL matches chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
