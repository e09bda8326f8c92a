//! Durable deferred actions (self-destruct timers)
//!
//! Timers live in the database rather than in memory, so a restart between
//! unlock and fire time loses nothing.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::models::{check_storable, format_ts, parse_ts};
use crate::error::{EngineError, Result};

/// Action name for self-destruct
pub const ACTION_DESTROY: &str = "destroy";

/// Fire time of a self-destruct armed at `unlocked_at`. Fails when the sum
/// overflows or lands outside the storable range.
pub fn destroy_at(unlocked_at: DateTime<Utc>, secs: i64) -> Result<DateTime<Utc>> {
    let fire_at = Duration::try_seconds(secs)
        .and_then(|delay| unlocked_at.checked_add_signed(delay))
        .ok_or_else(|| {
            EngineError::Persistence(format!("self-destruct delay of {}s overflows", secs))
        })?;
    check_storable(fire_at, "self-destruct time")
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
    Ok(fire_at)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredAction {
    pub id: i64,
    pub record_id: String,
    pub action: String,
    pub fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeferredAction {
    fn from_row(row: &Row) -> Result<Self> {
        let fire_at: String = row.get("fire_at")?;
        let created_at: String = row.get("created_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;
        Ok(Self {
            id: row.get("id")?,
            record_id: row.get("record_id")?,
            action: row.get("action")?,
            fire_at: parse_ts(&fire_at)?,
            created_at: parse_ts(&created_at)?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Arm an action. Re-arming an existing (record, action) pair is a no-op.
pub fn schedule(
    conn: &Connection,
    record_id: &str,
    action: &str,
    fire_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO deferred_actions (record_id, action, fire_at, created_at) \
         VALUES (?, ?, ?, ?)",
        params![record_id, action, format_ts(fire_at), format_ts(now)],
    )?;
    Ok(changed > 0)
}

/// Pending actions whose fire time has passed, oldest first
pub fn due(conn: &Connection, action: &str, now: DateTime<Utc>) -> Result<Vec<DeferredAction>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM deferred_actions \
         WHERE action = ? AND completed_at IS NULL AND fire_at <= ? \
         ORDER BY fire_at ASC, id",
    )?;
    let mut rows = stmt.query(params![action, format_ts(now)])?;

    let mut actions = vec![];
    while let Some(row) = rows.next()? {
        actions.push(DeferredAction::from_row(row)?);
    }
    Ok(actions)
}

/// Mark an action completed. Returns false if it already was.
pub fn complete(conn: &Connection, id: i64, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE deferred_actions SET completed_at = ? WHERE id = ? AND completed_at IS NULL",
        params![format_ts(at), id],
    )?;
    Ok(changed > 0)
}

pub fn get_for_record(
    conn: &Connection,
    record_id: &str,
    action: &str,
) -> Result<Option<DeferredAction>> {
    let mut stmt =
        conn.prepare("SELECT * FROM deferred_actions WHERE record_id = ? AND action = ?")?;
    let mut rows = stmt.query(params![record_id, action])?;
    match rows.next()? {
        Some(row) => Ok(Some(DeferredAction::from_row(row)?)),
        None => Ok(None),
    }
}
