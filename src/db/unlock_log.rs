//! Append-only unlock audit log

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::models::{format_ts, parse_ts, UnlockMethod};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnlockLogEntry {
    pub id: i64,
    pub record_id: String,
    pub unlocked_by: String,
    pub method: UnlockMethod,
    pub unlocked_at: DateTime<Utc>,
}

impl UnlockLogEntry {
    fn from_row(row: &Row) -> Result<Self> {
        let method: String = row.get("method")?;
        let unlocked_at: String = row.get("unlocked_at")?;
        Ok(Self {
            id: row.get("id")?,
            record_id: row.get("record_id")?,
            unlocked_by: row.get("unlocked_by")?,
            method: UnlockMethod::parse(&method)?,
            unlocked_at: parse_ts(&unlocked_at)?,
        })
    }
}

/// Append an entry. A second entry for the same record is ignored, so a
/// retried append after an ambiguous failure cannot duplicate.
pub fn append(
    conn: &Connection,
    record_id: &str,
    unlocked_by: &str,
    method: UnlockMethod,
    at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO unlock_log (record_id, unlocked_by, method, unlocked_at) \
         VALUES (?, ?, ?, ?)",
        params![record_id, unlocked_by, method.as_str(), format_ts(at)],
    )?;
    Ok(changed > 0)
}

pub fn get_for_record(conn: &Connection, record_id: &str) -> Result<Vec<UnlockLogEntry>> {
    let mut stmt = conn.prepare("SELECT * FROM unlock_log WHERE record_id = ? ORDER BY id")?;
    let mut rows = stmt.query(params![record_id])?;

    let mut entries = vec![];
    while let Some(row) = rows.next()? {
        entries.push(UnlockLogEntry::from_row(row)?);
    }
    Ok(entries)
}
