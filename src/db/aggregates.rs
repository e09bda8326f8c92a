//! Per (user, day, tag) unlock counters

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::models::{format_day, parse_day};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateRow {
    pub user_id: String,
    pub date: NaiveDate,
    pub tag: String,
    pub count: i64,
}

pub fn increment(conn: &Connection, user_id: &str, day: NaiveDate, tag: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO emotional_aggregates (user_id, date, tag, count) VALUES (?, ?, ?, 1) \
         ON CONFLICT(user_id, date, tag) DO UPDATE SET count = count + 1",
        params![user_id, format_day(day), tag],
    )?;
    Ok(())
}

/// Drop all counters and re-derive them from the unlock log joined with the
/// surviving records. Returns the number of rows written.
pub fn rebuild(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM emotional_aggregates", [])?;
    let written = tx.execute(
        r#"
        INSERT INTO emotional_aggregates (user_id, date, tag, count)
        SELECT r.owner_id, substr(l.unlocked_at, 1, 10), r.emotional_tag, COUNT(*)
        FROM unlock_log l
        JOIN records r ON r.id = l.record_id
        WHERE r.emotional_tag IS NOT NULL
        GROUP BY r.owner_id, substr(l.unlocked_at, 1, 10), r.emotional_tag
        "#,
        [],
    )?;
    tx.commit()?;
    Ok(written)
}

/// Rows for one user between `from` and `to` inclusive
pub fn for_range(
    conn: &Connection,
    user_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<AggregateRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, date, tag, count FROM emotional_aggregates \
         WHERE user_id = ? AND date >= ? AND date <= ? ORDER BY date ASC, tag ASC",
    )?;
    let mut rows = stmt.query(params![user_id, format_day(from), format_day(to)])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        let date: String = row.get(1)?;
        results.push(AggregateRow {
            user_id: row.get(0)?,
            date: parse_day(&date)?,
            tag: row.get(2)?,
            count: row.get(3)?,
        });
    }
    Ok(results)
}

/// Every row, ordered, for consistency checks
pub fn all(conn: &Connection) -> Result<Vec<AggregateRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, date, tag, count FROM emotional_aggregates ORDER BY user_id, date, tag",
    )?;
    let mut rows = stmt.query([])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        let date: String = row.get(1)?;
        results.push(AggregateRow {
            user_id: row.get(0)?,
            date: parse_day(&date)?,
            tag: row.get(2)?,
            count: row.get(3)?,
        });
    }
    Ok(results)
}
