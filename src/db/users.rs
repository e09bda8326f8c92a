//! User activity mirror and content keys

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{format_ts, parse_ts};
use crate::cipher::UserKey;
use crate::error::{EngineError, Result};

/// User row (the content key is only handed out through `get_user_key`)
#[derive(Debug, Clone)]
pub struct UserRow {
    pub user_id: String,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    fn from_row(row: &Row) -> Result<Self> {
        let last_active: Option<String> = row.get("last_active_at")?;
        let created: String = row.get("created_at")?;
        Ok(Self {
            user_id: row.get("user_id")?,
            last_active_at: last_active.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&created)?,
        })
    }

    /// Last moment the user was seen; registration counts as activity
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_active_at.unwrap_or(self.created_at)
    }
}

/// Register a user with their freshly generated content key
pub fn insert_user(
    conn: &Connection,
    user_id: &str,
    key: &UserKey,
    now: DateTime<Utc>,
) -> Result<UserRow> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO users (user_id, content_key, last_active_at, created_at) \
         VALUES (?, ?, ?, ?)",
        params![user_id, key.as_bytes().as_slice(), format_ts(now), format_ts(now)],
    )?;

    if changed == 0 {
        return Err(EngineError::Validation(format!("user {} already registered", user_id)));
    }

    get_user(conn, user_id)?
        .ok_or_else(|| EngineError::Persistence("User not found after insert".into()))
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, last_active_at, created_at FROM users WHERE user_id = ?",
    )?;
    let mut rows = stmt.query(params![user_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(UserRow::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn get_user_key(conn: &Connection, user_id: &str) -> Result<Option<UserKey>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT content_key FROM users WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;

    bytes.map(|b| UserKey::from_slice(&b)).transpose()
}

/// Record activity. Never moves `last_active_at` backwards.
pub fn touch_activity(conn: &Connection, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE users SET last_active_at = ? \
         WHERE user_id = ? AND (last_active_at IS NULL OR last_active_at < ?)",
        params![format_ts(at), user_id, format_ts(at)],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::generate_user_key;
    use crate::db::schema::init_schema;
    use chrono::{Duration, TimeZone};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_register_twice_rejected() {
        let conn = conn();
        let now = Utc::now();
        insert_user(&conn, "u1", &generate_user_key(), now).unwrap();
        assert!(matches!(
            insert_user(&conn, "u1", &generate_user_key(), now),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_key_persisted() {
        let conn = conn();
        let key = generate_user_key();
        insert_user(&conn, "u1", &key, Utc::now()).unwrap();
        let loaded = get_user_key(&conn, "u1").unwrap().unwrap();
        assert_eq!(loaded.as_bytes(), key.as_bytes());
        assert!(get_user_key(&conn, "nobody").unwrap().is_none());
    }

    #[test]
    fn test_activity_is_monotonic() {
        let conn = conn();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        insert_user(&conn, "u1", &generate_user_key(), now).unwrap();

        assert!(touch_activity(&conn, "u1", now + Duration::hours(1)).unwrap());
        assert!(!touch_activity(&conn, "u1", now).unwrap());

        let user = get_user(&conn, "u1").unwrap().unwrap();
        assert_eq!(user.last_seen(), now + Duration::hours(1));
    }
}
