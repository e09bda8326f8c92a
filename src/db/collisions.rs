//! Collision rows: one per (user, day) with two or more unlocks

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::models::{format_day, format_ts, parse_day, parse_ts};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollisionRow {
    pub id: i64,
    pub date: NaiveDate,
    pub user_id: String,
    /// Sorted ascending
    pub record_ids: Vec<String>,
    pub dominant_tag: Option<String>,
    pub theme: String,
    pub created_at: DateTime<Utc>,
}

impl CollisionRow {
    fn from_row(row: &Row) -> Result<Self> {
        let date: String = row.get("collision_date")?;
        let ids_json: String = row.get("record_ids_json")?;
        let created_at: String = row.get("created_at")?;
        Ok(Self {
            id: row.get("id")?,
            date: parse_day(&date)?,
            user_id: row.get("user_id")?,
            record_ids: serde_json::from_str(&ids_json)?,
            dominant_tag: row.get("dominant_tag")?,
            theme: row.get("theme")?,
            created_at: parse_ts(&created_at)?,
        })
    }
}

/// What an upsert did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionChange {
    Created,
    RecordsChanged,
    /// Same id set, different dominant tag or theme
    ThemeChanged,
    Unchanged,
}

impl CollisionChange {
    /// Only a new row or a changed id set notifies observers
    pub fn should_notify(&self) -> bool {
        matches!(self, CollisionChange::Created | CollisionChange::RecordsChanged)
    }
}

/// Insert or update the collision for (user, day). `created_at` survives
/// recomputation and an identical recomputation writes nothing.
pub fn upsert(
    conn: &Connection,
    user_id: &str,
    day: NaiveDate,
    record_ids: &[String],
    dominant_tag: Option<&str>,
    theme: &str,
    now: DateTime<Utc>,
) -> Result<CollisionChange> {
    let mut sorted = record_ids.to_vec();
    sorted.sort();
    sorted.dedup();

    let change = match get(conn, user_id, day)? {
        None => CollisionChange::Created,
        Some(existing) if existing.record_ids != sorted => CollisionChange::RecordsChanged,
        Some(existing)
            if existing.dominant_tag.as_deref() != dominant_tag || existing.theme != theme =>
        {
            CollisionChange::ThemeChanged
        }
        Some(_) => return Ok(CollisionChange::Unchanged),
    };

    conn.execute(
        r#"
        INSERT INTO collisions (collision_date, user_id, record_ids_json, dominant_tag, theme, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, collision_date) DO UPDATE SET
            record_ids_json = excluded.record_ids_json,
            dominant_tag = excluded.dominant_tag,
            theme = excluded.theme
        "#,
        params![
            format_day(day),
            user_id,
            serde_json::to_string(&sorted)?,
            dominant_tag,
            theme,
            format_ts(now),
        ],
    )?;

    Ok(change)
}

pub fn get(conn: &Connection, user_id: &str, day: NaiveDate) -> Result<Option<CollisionRow>> {
    let mut stmt =
        conn.prepare("SELECT * FROM collisions WHERE user_id = ? AND collision_date = ?")?;
    let mut rows = stmt.query(params![user_id, format_day(day)])?;
    match rows.next()? {
        Some(row) => Ok(Some(CollisionRow::from_row(row)?)),
        None => Ok(None),
    }
}

/// A user's collisions, newest day first
pub fn history(conn: &Connection, user_id: &str, limit: u32) -> Result<Vec<CollisionRow>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM collisions WHERE user_id = ? ORDER BY collision_date DESC LIMIT ?",
    )?;
    let mut rows = stmt.query(params![user_id, i64::from(limit)])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(CollisionRow::from_row(row)?);
    }
    Ok(results)
}

/// A user's collisions on or after `from`
pub fn since(conn: &Connection, user_id: &str, from: NaiveDate) -> Result<Vec<CollisionRow>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM collisions WHERE user_id = ? AND collision_date >= ? \
         ORDER BY collision_date ASC",
    )?;
    let mut rows = stmt.query(params![user_id, format_day(from)])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(CollisionRow::from_row(row)?);
    }
    Ok(results)
}

/// `(tag, owner_id, record_id)` for public, tagged records unlocked on `day`
pub fn public_tagged_unlocks(
    conn: &Connection,
    day: NaiveDate,
) -> Result<Vec<(String, String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT emotional_tag, owner_id, id FROM records \
         WHERE visibility = 'public' AND unlocked_at IS NOT NULL \
           AND emotional_tag IS NOT NULL AND substr(unlocked_at, 1, 10) = ? \
         ORDER BY emotional_tag, owner_id, id",
    )?;
    let rows = stmt.query_map(params![format_day(day)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;

    let mut results = vec![];
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use chrono::{Duration, TimeZone};

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_upsert_lifecycle() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 0).unwrap();
        let t2 = t1 + Duration::days(1);

        let change = upsert(&conn, "u1", day, &ids(&["b", "a"]), Some("happy"), "Joyful Convergence", t1)
            .unwrap();
        assert_eq!(change, CollisionChange::Created);

        let first = get(&conn, "u1", day).unwrap().unwrap();
        assert_eq!(first.record_ids, ids(&["a", "b"]));

        let change = upsert(&conn, "u1", day, &ids(&["a", "b"]), Some("happy"), "Joyful Convergence", t2)
            .unwrap();
        assert_eq!(change, CollisionChange::Unchanged);
        assert_eq!(get(&conn, "u1", day).unwrap().unwrap(), first);

        let change = upsert(&conn, "u1", day, &ids(&["a", "b"]), Some("love"), "Love Collision", t2)
            .unwrap();
        assert_eq!(change, CollisionChange::ThemeChanged);
        assert!(!change.should_notify());

        let change = upsert(&conn, "u1", day, &ids(&["a", "b", "c"]), Some("love"), "Love Collision", t2)
            .unwrap();
        assert!(change.should_notify());

        let updated = get(&conn, "u1", day).unwrap().unwrap();
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.created_at, t1);
        assert_eq!(history(&conn, "u1", 10).unwrap().len(), 1);
    }
}
