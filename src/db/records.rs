//! Record CRUD and the conditional state transitions

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{format_ts, parse_ts, UnlockCondition, UnlockOutcome, Visibility};
use crate::cipher::SealedPayload;
use crate::error::{EngineError, Result};

/// Excludes chained sequence members from condition evaluation
const NOT_SEQUENCE_CHILD: &str = "NOT (r.parent_id IS NOT NULL AND r.sequence_order > 1)";

const SUMMARY_COLUMNS: &str = "r.id, r.owner_id, r.recipient_id, r.parent_id, r.sequence_order, \
     r.title, r.condition_type, r.unlocked_at, r.view_count, r.visibility, r.ripple_expand_at, \
     r.self_destruct_after_secs, r.emotional_tag, r.created_at";

/// Full record row, including the sealed payload
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub id: String,
    pub owner_id: String,
    pub recipient_id: Option<String>,
    pub parent_id: Option<String>,
    pub sequence_order: i64,
    pub title: String,
    pub sealed: SealedPayload,
    pub condition: UnlockCondition,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub view_count: i64,
    pub visibility: Visibility,
    pub ripple_expand_at: Option<DateTime<Utc>>,
    pub self_destruct_after_secs: Option<i64>,
    pub emotional_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RecordRow {
    fn from_row(row: &Row) -> Result<Self> {
        let unlocked_at: Option<String> = row.get("unlocked_at")?;
        let ripple_expand_at: Option<String> = row.get("ripple_expand_at")?;
        let visibility: String = row.get("visibility")?;
        let created_at: String = row.get("created_at")?;
        let condition_type: String = row.get("condition_type")?;

        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            recipient_id: row.get("recipient_id")?,
            parent_id: row.get("parent_id")?,
            sequence_order: row.get("sequence_order")?,
            title: row.get("title")?,
            sealed: SealedPayload {
                algorithm: row.get("cipher_algorithm")?,
                nonce: row.get("cipher_nonce")?,
                ciphertext: row.get("sealed_payload")?,
                tag: row.get("cipher_tag")?,
            },
            condition: UnlockCondition::from_columns(
                &condition_type,
                row.get("condition_at")?,
                row.get("condition_days")?,
                row.get("condition_key")?,
            )?,
            unlocked_at: unlocked_at.as_deref().map(parse_ts).transpose()?,
            view_count: row.get("view_count")?,
            visibility: Visibility::parse(&visibility)?,
            ripple_expand_at: ripple_expand_at.as_deref().map(parse_ts).transpose()?,
            self_destruct_after_secs: row.get("self_destruct_after_secs")?,
            emotional_tag: row.get("emotional_tag")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.unlocked_at.is_none()
    }

    /// Whether `viewer` may see this record at all (locked or not)
    pub fn is_visible_to(&self, viewer: &str) -> bool {
        self.owner_id == viewer
            || self.recipient_id.as_deref() == Some(viewer)
            || (self.visibility > Visibility::Private && !self.is_locked())
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            recipient_id: self.recipient_id.clone(),
            parent_id: self.parent_id.clone(),
            sequence_order: self.sequence_order,
            title: self.title.clone(),
            condition_type: self.condition.kind().to_string(),
            is_locked: self.is_locked(),
            unlocked_at: self.unlocked_at,
            view_count: self.view_count,
            visibility: self.visibility,
            ripple_expand_at: self.ripple_expand_at,
            self_destruct_after_secs: self.self_destruct_after_secs,
            emotional_tag: self.emotional_tag.clone(),
            created_at: self.created_at,
        }
    }
}

/// Payload-free projection used for listings, candidates and events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSummary {
    pub id: String,
    pub owner_id: String,
    pub recipient_id: Option<String>,
    pub parent_id: Option<String>,
    pub sequence_order: i64,
    pub title: String,
    pub condition_type: String,
    pub is_locked: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub view_count: i64,
    pub visibility: Visibility,
    pub ripple_expand_at: Option<DateTime<Utc>>,
    pub self_destruct_after_secs: Option<i64>,
    pub emotional_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RecordSummary {
    fn from_row(row: &Row) -> Result<Self> {
        let unlocked_at: Option<String> = row.get("unlocked_at")?;
        let ripple_expand_at: Option<String> = row.get("ripple_expand_at")?;
        let visibility: String = row.get("visibility")?;
        let created_at: String = row.get("created_at")?;

        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            recipient_id: row.get("recipient_id")?,
            parent_id: row.get("parent_id")?,
            sequence_order: row.get("sequence_order")?,
            title: row.get("title")?,
            condition_type: row.get("condition_type")?,
            is_locked: unlocked_at.is_none(),
            unlocked_at: unlocked_at.as_deref().map(parse_ts).transpose()?,
            view_count: row.get("view_count")?,
            visibility: Visibility::parse(&visibility)?,
            ripple_expand_at: ripple_expand_at.as_deref().map(parse_ts).transpose()?,
            self_destruct_after_secs: row.get("self_destruct_after_secs")?,
            emotional_tag: row.get("emotional_tag")?,
            created_at: parse_ts(&created_at)?,
        })
    }
}

/// Input for creating a record. `content` is plaintext and is sealed before
/// it reaches the store.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRecordInput {
    pub owner_id: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub title: String,
    pub content: String,
    pub condition: UnlockCondition,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default)]
    pub ripple_expand_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub self_destruct_after_secs: Option<i64>,
    #[serde(default)]
    pub emotional_tag: Option<String>,
}

fn default_visibility() -> Visibility {
    Visibility::Private
}

/// Filter for owner listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    All,
    Locked,
    Unlocked,
}

/// Fully prepared row for insertion
pub(crate) struct NewRecord<'a> {
    pub id: &'a str,
    pub owner_id: &'a str,
    pub recipient_id: Option<&'a str>,
    pub parent_id: Option<&'a str>,
    pub sequence_order: i64,
    pub title: &'a str,
    pub sealed: &'a SealedPayload,
    pub condition: &'a UnlockCondition,
    pub visibility: Visibility,
    pub ripple_expand_at: Option<DateTime<Utc>>,
    pub self_destruct_after_secs: Option<i64>,
    pub emotional_tag: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Write Operations
// ============================================================================

/// Insert a locked record
pub(crate) fn insert_record(conn: &Connection, rec: &NewRecord<'_>) -> Result<()> {
    let cond = rec.condition.to_columns();

    conn.execute(
        r#"
        INSERT INTO records (
            id, owner_id, recipient_id, parent_id, sequence_order, title,
            sealed_payload, cipher_algorithm, cipher_nonce, cipher_tag,
            condition_type, condition_at, condition_days, condition_key,
            visibility, ripple_expand_at, self_destruct_after_secs, emotional_tag, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            rec.id,
            rec.owner_id,
            rec.recipient_id,
            rec.parent_id,
            rec.sequence_order,
            rec.title,
            rec.sealed.ciphertext,
            rec.sealed.algorithm,
            rec.sealed.nonce,
            rec.sealed.tag,
            cond.kind,
            cond.at,
            cond.days,
            cond.key,
            rec.visibility.as_str(),
            rec.ripple_expand_at.map(format_ts),
            rec.self_destruct_after_secs,
            rec.emotional_tag,
            format_ts(rec.created_at),
        ],
    )
    .map_err(map_constraint_error)?;

    Ok(())
}

fn map_constraint_error(e: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(ref err, Some(ref msg)) = e {
        if err.code == ErrorCode::ConstraintViolation {
            if msg.contains("cipher_nonce") {
                return EngineError::Validation("nonce reused for this owner's key".into());
            }
            if msg.contains("sequence_order") {
                return EngineError::Validation("sequence_order already used in this sequence".into());
            }
        }
    }
    EngineError::Database(e)
}

/// The one locked -> unlocked transition. Only succeeds if still locked.
pub fn try_unlock(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<UnlockOutcome> {
    let changed = conn.execute(
        "UPDATE records SET unlocked_at = ? WHERE id = ? AND unlocked_at IS NULL",
        params![format_ts(at), id],
    )?;

    Ok(if changed == 1 {
        UnlockOutcome::Unlocked
    } else {
        UnlockOutcome::LostRace
    })
}

/// Transition a sequence child, guarded so that it only succeeds when the
/// parent and every lower-ordered sibling are already unlocked.
pub fn try_unlock_in_sequence(
    conn: &Connection,
    id: &str,
    at: DateTime<Utc>,
) -> Result<UnlockOutcome> {
    let changed = conn.execute(
        r#"
        UPDATE records SET unlocked_at = ?
        WHERE id = ? AND unlocked_at IS NULL AND parent_id IS NOT NULL
          AND NOT EXISTS (
              SELECT 1 FROM records p
              WHERE p.id = records.parent_id AND p.unlocked_at IS NULL
          )
          AND NOT EXISTS (
              SELECT 1 FROM records s
              WHERE s.parent_id = records.parent_id
                AND s.sequence_order < records.sequence_order
                AND s.unlocked_at IS NULL
          )
        "#,
        params![format_ts(at), id],
    )?;

    Ok(if changed == 1 {
        UnlockOutcome::Unlocked
    } else {
        UnlockOutcome::LostRace
    })
}

/// Increment the view counter of an unlocked record
pub fn record_view(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE records SET view_count = view_count + 1 WHERE id = ? AND unlocked_at IS NOT NULL",
        params![id],
    )?;
    Ok(changed > 0)
}

/// Owner moves a private record into the ripple tier
pub fn set_ripple(
    conn: &Connection,
    id: &str,
    owner_id: &str,
    expand_at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE records SET visibility = 'ripple', ripple_expand_at = ? \
         WHERE id = ? AND owner_id = ? AND visibility = 'private'",
        params![format_ts(expand_at), id, owner_id],
    )?;
    Ok(changed > 0)
}

/// Ripple -> public, only for unlocked records whose expansion time passed
pub fn promote_to_public(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE records SET visibility = 'public' \
         WHERE id = ? AND visibility = 'ripple' AND unlocked_at IS NOT NULL \
           AND ripple_expand_at IS NOT NULL AND ripple_expand_at <= ?",
        params![id, format_ts(now)],
    )?;
    Ok(changed > 0)
}

/// Delete a record (self-destruct)
pub fn delete_record(conn: &Connection, id: &str) -> Result<bool> {
    let changes = conn.execute("DELETE FROM records WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get record by ID
pub fn get_record(conn: &Connection, id: &str) -> Result<Option<RecordRow>> {
    let mut stmt = conn.prepare("SELECT * FROM records WHERE id = ?")?;
    let mut rows = stmt.query(params![id])?;

    match rows.next()? {
        Some(row) => Ok(Some(RecordRow::from_row(row)?)),
        None => Ok(None),
    }
}

fn query_summaries(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<RecordSummary>> {
    debug!("Executing query: {}", sql);
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(RecordSummary::from_row(row)?);
    }
    Ok(results)
}

/// Records owned by a user, newest first
pub fn list_for_owner(
    conn: &Connection,
    owner_id: &str,
    status: RecordStatus,
) -> Result<Vec<RecordSummary>> {
    let filter = match status {
        RecordStatus::All => "",
        RecordStatus::Locked => " AND r.unlocked_at IS NULL",
        RecordStatus::Unlocked => " AND r.unlocked_at IS NOT NULL",
    };
    let sql = format!(
        "SELECT {} FROM records r WHERE r.owner_id = ?{} ORDER BY r.created_at DESC, r.id",
        SUMMARY_COLUMNS, filter
    );
    query_summaries(conn, &sql, &[&owner_id])
}

/// Unlocked ripple/public records, most recently unlocked first
pub fn list_public_feed(conn: &Connection, limit: u32, offset: u32) -> Result<Vec<RecordSummary>> {
    let sql = format!(
        "SELECT {} FROM records r \
         WHERE r.visibility IN ('public', 'ripple') AND r.unlocked_at IS NOT NULL \
         ORDER BY r.unlocked_at DESC, r.id LIMIT ? OFFSET ?",
        SUMMARY_COLUMNS
    );
    query_summaries(conn, &sql, &[&i64::from(limit), &i64::from(offset)])
}

/// Summaries for a set of ids, in unlock order
pub fn get_summaries(conn: &Connection, ids: &[String]) -> Result<Vec<RecordSummary>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<_> = ids.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT {} FROM records r WHERE r.id IN ({}) ORDER BY r.unlocked_at ASC, r.id",
        SUMMARY_COLUMNS,
        placeholders.join(", ")
    );
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    query_summaries(conn, &sql, &param_refs)
}

/// Locked date-condition records that are due. `owner_id` scopes to one user.
pub fn due_date_candidates(
    conn: &Connection,
    now: DateTime<Utc>,
    owner_id: Option<&str>,
) -> Result<Vec<RecordSummary>> {
    let now = format_ts(now);
    let mut sql = format!(
        "SELECT {} FROM records r \
         WHERE r.unlocked_at IS NULL AND r.condition_type = 'date' AND r.condition_at <= ? AND {}",
        SUMMARY_COLUMNS, NOT_SEQUENCE_CHILD
    );
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![&now];
    if let Some(ref owner) = owner_id {
        sql.push_str(" AND r.owner_id = ?");
        params.push(owner);
    }
    sql.push_str(" ORDER BY r.condition_at ASC, r.id");
    query_summaries(conn, &sql, &params)
}

/// Locked inactivity-condition records paired with the threshold and the
/// owner's current last-seen timestamp. Evaluation happens in the scheduler.
pub fn inactivity_candidates(
    conn: &Connection,
    owner_id: Option<&str>,
) -> Result<Vec<(RecordSummary, u32, DateTime<Utc>)>> {
    let mut sql = format!(
        "SELECT {}, r.condition_days, COALESCE(u.last_active_at, u.created_at) AS last_seen \
         FROM records r JOIN users u ON u.user_id = r.owner_id \
         WHERE r.unlocked_at IS NULL AND r.condition_type = 'inactivity' AND {}",
        SUMMARY_COLUMNS, NOT_SEQUENCE_CHILD
    );
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![];
    if let Some(ref owner) = owner_id {
        sql.push_str(" AND r.owner_id = ?");
        params.push(owner);
    }
    sql.push_str(" ORDER BY r.created_at ASC, r.id");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params.as_slice())?;
    let mut results = vec![];
    while let Some(row) = rows.next()? {
        let summary = RecordSummary::from_row(row)?;
        let days: i64 = row.get("condition_days")?;
        let last_seen: String = row.get("last_seen")?;
        let days = u32::try_from(days)
            .map_err(|_| EngineError::Persistence(format!("Bad inactivity days: {}", days)))?;
        results.push((summary, days, parse_ts(&last_seen)?));
    }
    Ok(results)
}

/// Locked event-condition records whose key has been reported
pub fn event_candidates(
    conn: &Connection,
    owner_id: Option<&str>,
) -> Result<Vec<RecordSummary>> {
    let mut sql = format!(
        "SELECT {} FROM records r \
         WHERE r.unlocked_at IS NULL AND r.condition_type = 'event' AND {} \
           AND r.condition_key IN (SELECT event_key FROM reported_events)",
        SUMMARY_COLUMNS, NOT_SEQUENCE_CHILD
    );
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![];
    if let Some(ref owner) = owner_id {
        sql.push_str(" AND r.owner_id = ?");
        params.push(owner);
    }
    sql.push_str(" ORDER BY r.created_at ASC, r.id");
    query_summaries(conn, &sql, &params)
}

/// Lowest-ordered locked child of a sequence parent
pub fn next_sequence_child(conn: &Connection, parent_id: &str) -> Result<Option<RecordSummary>> {
    let sql = format!(
        "SELECT {} FROM records r WHERE r.parent_id = ? AND r.unlocked_at IS NULL \
         ORDER BY r.sequence_order ASC LIMIT 1",
        SUMMARY_COLUMNS
    );
    Ok(query_summaries(conn, &sql, &[&parent_id])?.into_iter().next())
}

/// Unlocked ripple records whose expansion time has passed
pub fn ripple_due(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<RecordSummary>> {
    let now = format_ts(now);
    let sql = format!(
        "SELECT {} FROM records r \
         WHERE r.visibility = 'ripple' AND r.unlocked_at IS NOT NULL \
           AND r.ripple_expand_at IS NOT NULL AND r.ripple_expand_at <= ? \
         ORDER BY r.ripple_expand_at ASC, r.id",
        SUMMARY_COLUMNS
    );
    query_summaries(conn, &sql, &[&now])
}

/// Records unlocked on a calendar day (`YYYY-MM-DD`, UTC)
pub fn unlocked_on_day(conn: &Connection, day: &str) -> Result<Vec<RecordSummary>> {
    let sql = format!(
        "SELECT {} FROM records r \
         WHERE r.unlocked_at IS NOT NULL AND substr(r.unlocked_at, 1, 10) = ? \
         ORDER BY r.owner_id, r.id",
        SUMMARY_COLUMNS
    );
    query_summaries(conn, &sql, &[&day])
}

/// Full rows unlocked on `day` that `viewer` owns, receives, or can see
/// through ripple/public visibility. Most recently unlocked first.
pub fn echo_rows_on_day(conn: &Connection, viewer: &str, day: &str) -> Result<Vec<RecordRow>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM records \
         WHERE unlocked_at IS NOT NULL AND substr(unlocked_at, 1, 10) = ? \
           AND (owner_id = ? OR recipient_id = ? OR visibility IN ('public', 'ripple')) \
         ORDER BY unlocked_at DESC, id",
    )?;
    let mut rows = stmt.query(params![day, viewer, viewer])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(RecordRow::from_row(row)?);
    }
    Ok(results)
}

/// Unlocked records with a self-destruct duration but no deferred action
pub fn missing_destruct_actions(conn: &Connection) -> Result<Vec<RecordSummary>> {
    let sql = format!(
        "SELECT {} FROM records r \
         WHERE r.unlocked_at IS NOT NULL AND r.self_destruct_after_secs IS NOT NULL \
           AND NOT EXISTS ( \
               SELECT 1 FROM deferred_actions d \
               WHERE d.record_id = r.id AND d.action = 'destroy' \
           ) \
         ORDER BY r.unlocked_at ASC, r.id",
        SUMMARY_COLUMNS
    );
    query_summaries(conn, &sql, &[])
}

// ============================================================================
// Reported events
// ============================================================================

/// Persist an external event key. Returns false if it was already known.
pub fn report_event_key(conn: &Connection, key: &str, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO reported_events (event_key, reported_at) VALUES (?, ?)",
        params![key, format_ts(at)],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{generate_user_key, seal};
    use crate::db::schema::init_schema;
    use crate::db::users::insert_user;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        insert_user(&conn, "alice", &generate_user_key(), t0()).unwrap();
        conn
    }

    fn insert(
        conn: &Connection,
        id: &str,
        condition: UnlockCondition,
        parent: Option<&str>,
        order: i64,
    ) -> SealedPayload {
        let sealed = seal(b"body", &generate_user_key()).unwrap();
        insert_record(
            conn,
            &NewRecord {
                id,
                owner_id: "alice",
                recipient_id: None,
                parent_id: parent,
                sequence_order: order,
                title: "t",
                sealed: &sealed,
                condition: &condition,
                visibility: Visibility::Private,
                ripple_expand_at: None,
                self_destruct_after_secs: None,
                emotional_tag: None,
                created_at: t0(),
            },
        )
        .unwrap();
        sealed
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup();
        let sealed = insert(&conn, "r1", UnlockCondition::Event("graduation".into()), None, 1);

        let row = get_record(&conn, "r1").unwrap().unwrap();
        assert!(row.is_locked());
        assert_eq!(row.sealed, sealed);
        assert_eq!(row.condition, UnlockCondition::Event("graduation".into()));
        assert_eq!(row.visibility, Visibility::Private);
    }

    #[test]
    fn test_try_unlock_only_once() {
        let conn = setup();
        insert(&conn, "r1", UnlockCondition::Date(t0()), None, 1);

        assert_eq!(try_unlock(&conn, "r1", t0()).unwrap(), UnlockOutcome::Unlocked);
        assert_eq!(
            try_unlock(&conn, "r1", t0() + Duration::hours(1)).unwrap(),
            UnlockOutcome::LostRace
        );

        let row = get_record(&conn, "r1").unwrap().unwrap();
        assert_eq!(row.unlocked_at, Some(t0()));
        assert_eq!(try_unlock(&conn, "missing", t0()).unwrap(), UnlockOutcome::LostRace);
    }

    #[test]
    fn test_due_candidates_skip_sequence_children() {
        let conn = setup();
        let due = UnlockCondition::Date(t0() - Duration::days(1));
        insert(&conn, "head", due.clone(), None, 1);
        insert(&conn, "child", due.clone(), Some("head"), 2);
        insert(&conn, "future", UnlockCondition::Date(t0() + Duration::days(1)), None, 1);

        let ids: Vec<_> = due_date_candidates(&conn, t0(), None)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["head".to_string()]);
    }

    #[test]
    fn test_sequence_guard() {
        let conn = setup();
        let never = UnlockCondition::Event("never".into());
        insert(&conn, "head", never.clone(), None, 1);
        insert(&conn, "c2", never.clone(), Some("head"), 2);
        insert(&conn, "c3", never.clone(), Some("head"), 3);

        // parent still locked
        assert_eq!(try_unlock_in_sequence(&conn, "c2", t0()).unwrap(), UnlockOutcome::LostRace);

        try_unlock(&conn, "head", t0()).unwrap();
        // c2 still locked, so c3 cannot jump ahead
        assert_eq!(try_unlock_in_sequence(&conn, "c3", t0()).unwrap(), UnlockOutcome::LostRace);
        assert_eq!(try_unlock_in_sequence(&conn, "c2", t0()).unwrap(), UnlockOutcome::Unlocked);
        assert_eq!(try_unlock_in_sequence(&conn, "c3", t0()).unwrap(), UnlockOutcome::Unlocked);
    }

    #[test]
    fn test_duplicate_sequence_order_rejected() {
        let conn = setup();
        let never = UnlockCondition::Event("never".into());
        insert(&conn, "head", never.clone(), None, 1);
        insert(&conn, "c2", never.clone(), Some("head"), 2);

        let sealed = seal(b"x", &generate_user_key()).unwrap();
        let err = insert_record(
            &conn,
            &NewRecord {
                id: "c2b",
                owner_id: "alice",
                recipient_id: None,
                parent_id: Some("head"),
                sequence_order: 2,
                title: "t",
                sealed: &sealed,
                condition: &never,
                visibility: Visibility::Private,
                ripple_expand_at: None,
                self_destruct_after_secs: None,
                emotional_tag: None,
                created_at: t0(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_nonce_reuse_rejected() {
        let conn = setup();
        let sealed = insert(&conn, "r1", UnlockCondition::Date(t0()), None, 1);
        let cond = UnlockCondition::Date(t0());
        let err = insert_record(
            &conn,
            &NewRecord {
                id: "r2",
                owner_id: "alice",
                recipient_id: None,
                parent_id: None,
                sequence_order: 1,
                title: "t",
                sealed: &sealed,
                condition: &cond,
                visibility: Visibility::Private,
                ripple_expand_at: None,
                self_destruct_after_secs: None,
                emotional_tag: None,
                created_at: t0(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_visibility_never_regresses() {
        let conn = setup();
        insert(&conn, "r1", UnlockCondition::Date(t0()), None, 1);

        assert!(set_ripple(&conn, "r1", "alice", t0()).unwrap());
        // locked records are not promoted
        assert!(!promote_to_public(&conn, "r1", t0()).unwrap());

        try_unlock(&conn, "r1", t0()).unwrap();
        assert!(promote_to_public(&conn, "r1", t0()).unwrap());
        assert!(!promote_to_public(&conn, "r1", t0()).unwrap());

        // no way back to ripple
        assert!(!set_ripple(&conn, "r1", "alice", t0()).unwrap());
        let row = get_record(&conn, "r1").unwrap().unwrap();
        assert_eq!(row.visibility, Visibility::Public);
    }

    #[test]
    fn test_view_count_only_when_unlocked() {
        let conn = setup();
        insert(&conn, "r1", UnlockCondition::Date(t0()), None, 1);
        assert!(!record_view(&conn, "r1").unwrap());
        try_unlock(&conn, "r1", t0()).unwrap();
        assert!(record_view(&conn, "r1").unwrap());
        assert!(record_view(&conn, "r1").unwrap());
        assert_eq!(get_record(&conn, "r1").unwrap().unwrap().view_count, 2);
    }

    #[test]
    fn test_event_candidates_need_report() {
        let conn = setup();
        insert(&conn, "r1", UnlockCondition::Event("wedding".into()), None, 1);
        assert!(event_candidates(&conn, None).unwrap().is_empty());

        assert!(report_event_key(&conn, "wedding", t0()).unwrap());
        assert!(!report_event_key(&conn, "wedding", t0()).unwrap());
        assert_eq!(event_candidates(&conn, Some("alice")).unwrap().len(), 1);
        assert!(event_candidates(&conn, Some("bob")).unwrap().is_empty());
    }
}
