//! Record service - creation, access and owner-driven changes
//!
//! Plaintext enters here and is sealed under the owner's content key before
//! it reaches the store. It leaves again only through `open_record`, and only
//! once the record is unlocked.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cipher::{self, generate_user_key, UserKey};
use crate::db::records::{self, NewRecord};
use crate::db::users::{self, UserRow};
use crate::db::models::{check_storable, format_day};
use crate::db::{CreateRecordInput, EngineDb, RecordStatus, RecordSummary, Visibility};
use crate::error::{EngineError, Result};

const MAX_TITLE_LEN: usize = 200;
const MAX_TAG_LEN: usize = 50;
const MAX_FEED_PAGE: u32 = 100;
/// 100 years
pub const MAX_SELF_DESTRUCT_SECS: i64 = 100 * 365 * 86_400;

/// What a permitted viewer gets back
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordView {
    Locked { record: RecordSummary },
    Unlocked { record: RecordSummary, content: String },
}

/// One decrypted record in a viewer's daily echo
#[derive(Debug, Clone, Serialize)]
pub struct EchoEntry {
    pub record: RecordSummary,
    pub content: String,
}

pub struct RecordService {
    db: Arc<EngineDb>,
}

impl RecordService {
    pub fn new(db: Arc<EngineDb>) -> Self {
        Self { db }
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Register a user and generate their content key
    pub fn register_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserRow> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(EngineError::Validation("user_id is required".into()));
        }

        let key = generate_user_key();
        let user = self.db.with_conn(|conn| users::insert_user(conn, user_id, &key, now))?;
        info!(user_id = %user_id, "User registered");
        Ok(user)
    }

    /// Record user activity (monotonic)
    pub fn touch_activity(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        if self.db.with_conn(|conn| users::get_user(conn, user_id))?.is_none() {
            return Err(EngineError::NotFound(format!("user {}", user_id)));
        }
        self.db.with_conn(|conn| users::touch_activity(conn, user_id, at))?;
        Ok(())
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Seal and persist a single locked record
    pub fn create_record(&self, input: CreateRecordInput, now: DateTime<Utc>) -> Result<RecordSummary> {
        let input = normalize(input)?;
        let key = self.owner_key(&input.owner_id)?;
        let id = Uuid::new_v4().to_string();

        let summary = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            insert_sealed(&tx, &id, &input, &key, None, 1, now)?;
            let summary = load_summary(&tx, &id)?;
            tx.commit()?;
            Ok(summary)
        })?;

        debug!(record_id = %id, owner_id = %summary.owner_id, condition = %summary.condition_type, "Record created");
        Ok(summary)
    }

    /// Create a chained sequence. The first input becomes the head (order 1),
    /// the rest its children with orders 2..n. All or nothing.
    pub fn create_sequence(
        &self,
        owner_id: &str,
        inputs: Vec<CreateRecordInput>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecordSummary>> {
        if inputs.len() < 2 {
            return Err(EngineError::Validation("a sequence needs at least two records".into()));
        }

        let mut normalized = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.into_iter().enumerate() {
            if input.owner_id != owner_id {
                return Err(EngineError::Validation(format!(
                    "item[{}]: every record in a sequence must belong to {}",
                    i, owner_id
                )));
            }
            let input = normalize(input)
                .map_err(|e| EngineError::Validation(format!("item[{}]: {}", i, e)))?;
            normalized.push(input);
        }

        let key = self.owner_key(owner_id)?;
        let ids: Vec<String> = normalized.iter().map(|_| Uuid::new_v4().to_string()).collect();

        let summaries = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let head_id = ids[0].as_str();
            for (i, input) in normalized.iter().enumerate() {
                let parent = if i == 0 { None } else { Some(head_id) };
                insert_sealed(&tx, &ids[i], input, &key, parent, i as i64 + 1, now)?;
            }

            let mut summaries = Vec::with_capacity(ids.len());
            for id in &ids {
                summaries.push(load_summary(&tx, id)?);
            }
            tx.commit()?;
            Ok(summaries)
        })?;

        info!(owner_id = %owner_id, head = %ids[0], count = summaries.len(), "Sequence created");
        Ok(summaries)
    }

    /// Owner moves a private record into the ripple tier. Returns false when
    /// the record is already ripple or public.
    pub fn set_ripple(
        &self,
        record_id: &str,
        owner_id: &str,
        expand_at: DateTime<Utc>,
    ) -> Result<bool> {
        check_storable(expand_at, "ripple_expand_at")?;

        let record = self
            .db
            .with_conn(|conn| records::get_record(conn, record_id))?
            .ok_or_else(|| EngineError::NotFound(format!("record {}", record_id)))?;

        if record.owner_id != owner_id {
            return Err(EngineError::Forbidden(format!(
                "{} does not own record {}",
                owner_id, record_id
            )));
        }

        self.db
            .with_conn(|conn| records::set_ripple(conn, record_id, owner_id, expand_at))
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Open a record for `viewer`. Locked records come back without content;
    /// unlocked records are decrypted and their view count incremented.
    pub fn open_record(
        &self,
        record_id: &str,
        viewer: &str,
        now: DateTime<Utc>,
    ) -> Result<RecordView> {
        let record = self
            .db
            .with_conn(|conn| records::get_record(conn, record_id))?
            .ok_or_else(|| EngineError::NotFound(format!("record {}", record_id)))?;

        if !record.is_visible_to(viewer) {
            return Err(EngineError::Forbidden(format!(
                "{} may not view record {}",
                viewer, record_id
            )));
        }

        let mut summary = record.summary();
        if record.is_locked() {
            return Ok(RecordView::Locked { record: summary });
        }

        let key = self.owner_key(&record.owner_id)?;
        let plaintext = cipher::open(&record.sealed, &key)?;
        let content = String::from_utf8(plaintext)
            .map_err(|_| EngineError::Persistence(format!("record {} payload is not UTF-8", record_id)))?;

        if self.db.with_conn(|conn| records::record_view(conn, record_id))? {
            summary.view_count += 1;
        }
        self.db.with_conn(|conn| users::touch_activity(conn, viewer, now))?;

        Ok(RecordView::Unlocked {
            record: summary,
            content,
        })
    }

    /// Records unlocked on `day` (UTC) that `viewer` owns, receives, or can
    /// see publicly, decrypted and newest first. Records whose payload no
    /// longer opens are left out. View counts are not touched.
    pub fn echo_for_day(&self, viewer: &str, day: NaiveDate) -> Result<Vec<EchoEntry>> {
        let day_key = format_day(day);
        let rows = self
            .db
            .with_conn(|conn| records::echo_rows_on_day(conn, viewer, &day_key))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let content = self
                .owner_key(&row.owner_id)
                .and_then(|key| cipher::open(&row.sealed, &key))
                .and_then(|plaintext| {
                    String::from_utf8(plaintext).map_err(|_| {
                        EngineError::Persistence(format!("record {} payload is not UTF-8", row.id))
                    })
                });

            match content {
                Ok(content) => entries.push(EchoEntry {
                    record: row.summary(),
                    content,
                }),
                Err(e) => {
                    warn!(record_id = %row.id, error = %e, "Skipping undecryptable record in echo");
                }
            }
        }

        debug!(viewer = %viewer, day = %day_key, count = entries.len(), "Echo assembled");
        Ok(entries)
    }

    pub fn list_for_user(&self, user_id: &str, status: RecordStatus) -> Result<Vec<RecordSummary>> {
        self.db
            .with_conn(|conn| records::list_for_owner(conn, user_id, status))
    }

    pub fn public_feed(&self, limit: u32, offset: u32) -> Result<Vec<RecordSummary>> {
        let limit = limit.clamp(1, MAX_FEED_PAGE);
        self.db
            .with_conn(|conn| records::list_public_feed(conn, limit, offset))
    }

    pub fn get(&self, record_id: &str) -> Result<Option<RecordSummary>> {
        Ok(self
            .db
            .with_conn(|conn| records::get_record(conn, record_id))?
            .map(|r| r.summary()))
    }

    fn owner_key(&self, owner_id: &str) -> Result<UserKey> {
        self.db
            .with_conn(|conn| users::get_user_key(conn, owner_id))?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", owner_id)))
    }
}

fn insert_sealed(
    conn: &rusqlite::Connection,
    id: &str,
    input: &CreateRecordInput,
    key: &UserKey,
    parent_id: Option<&str>,
    sequence_order: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let sealed = cipher::seal(input.content.as_bytes(), key)?;
    records::insert_record(
        conn,
        &NewRecord {
            id,
            owner_id: &input.owner_id,
            recipient_id: input.recipient_id.as_deref(),
            parent_id,
            sequence_order,
            title: &input.title,
            sealed: &sealed,
            condition: &input.condition,
            visibility: input.visibility,
            ripple_expand_at: input.ripple_expand_at,
            self_destruct_after_secs: input.self_destruct_after_secs,
            emotional_tag: input.emotional_tag.as_deref(),
            created_at: now,
        },
    )
}

fn load_summary(conn: &rusqlite::Connection, id: &str) -> Result<RecordSummary> {
    records::get_record(conn, id)?
        .map(|r| r.summary())
        .ok_or_else(|| EngineError::Persistence("Record not found after insert".into()))
}

/// Validate creation input and normalize free-text fields
fn normalize(mut input: CreateRecordInput) -> Result<CreateRecordInput> {
    input.title = input.title.trim().to_string();
    if input.title.is_empty() {
        return Err(EngineError::Validation("title is required".into()));
    }
    if input.title.chars().count() > MAX_TITLE_LEN {
        return Err(EngineError::Validation(format!(
            "title must be <= {} characters",
            MAX_TITLE_LEN
        )));
    }
    if input.content.trim().is_empty() {
        return Err(EngineError::Validation("content is required".into()));
    }

    input.condition.validate()?;

    if let Some(secs) = input.self_destruct_after_secs {
        if secs <= 0 {
            return Err(EngineError::Validation(
                "self_destruct_after_secs must be positive".into(),
            ));
        }
        if secs > MAX_SELF_DESTRUCT_SECS {
            return Err(EngineError::Validation(format!(
                "self_destruct_after_secs must be <= {}",
                MAX_SELF_DESTRUCT_SECS
            )));
        }
    }

    if let Some(expand_at) = input.ripple_expand_at {
        check_storable(expand_at, "ripple_expand_at")?;
    }

    match (input.visibility, input.ripple_expand_at) {
        (Visibility::Ripple, None) => {
            return Err(EngineError::Validation(
                "ripple visibility requires ripple_expand_at".into(),
            ))
        }
        (Visibility::Private | Visibility::Public, Some(_)) => {
            return Err(EngineError::Validation(
                "ripple_expand_at is only valid with ripple visibility".into(),
            ))
        }
        _ => {}
    }

    input.emotional_tag = match input.emotional_tag.take() {
        Some(tag) => {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() {
                None
            } else if tag.chars().count() > MAX_TAG_LEN {
                return Err(EngineError::Validation(format!(
                    "emotional_tag must be <= {} characters",
                    MAX_TAG_LEN
                )));
            } else {
                Some(tag)
            }
        }
        None => None,
    };

    input.recipient_id = input
        .recipient_id
        .take()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());

    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UnlockCondition;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap()
    }

    fn service() -> RecordService {
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        let svc = RecordService::new(db);
        svc.register_user("alice", t0()).unwrap();
        svc.register_user("bob", t0()).unwrap();
        svc
    }

    fn input(title: &str, condition: UnlockCondition) -> CreateRecordInput {
        CreateRecordInput {
            owner_id: "alice".into(),
            recipient_id: None,
            title: title.into(),
            content: format!("body of {}", title),
            condition,
            visibility: Visibility::Private,
            ripple_expand_at: None,
            self_destruct_after_secs: None,
            emotional_tag: Some(" Happy ".into()),
        }
    }

    #[test]
    fn test_create_validates() {
        let svc = service();

        let mut bad = input("  ", UnlockCondition::Date(t0()));
        assert!(matches!(svc.create_record(bad.clone(), t0()), Err(EngineError::Validation(_))));

        bad.title = "ok".into();
        bad.condition = UnlockCondition::Inactivity(0);
        assert!(matches!(svc.create_record(bad.clone(), t0()), Err(EngineError::Validation(_))));

        bad.condition = UnlockCondition::Date(t0());
        bad.visibility = Visibility::Ripple;
        assert!(matches!(svc.create_record(bad.clone(), t0()), Err(EngineError::Validation(_))));

        bad.owner_id = "nobody".into();
        bad.visibility = Visibility::Private;
        assert!(matches!(svc.create_record(bad, t0()), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_create_rejects_unstorable_times() {
        let svc = service();

        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            svc.create_record(input("Far", UnlockCondition::Date(far)), t0()),
            Err(EngineError::Validation(_))
        ));

        let mut ripple = input("Ripple", UnlockCondition::Date(t0()));
        ripple.visibility = Visibility::Ripple;
        ripple.ripple_expand_at = Some(far);
        assert!(matches!(svc.create_record(ripple, t0()), Err(EngineError::Validation(_))));

        let rec = svc
            .create_record(input("Letter", UnlockCondition::Date(t0())), t0())
            .unwrap();
        assert!(matches!(
            svc.set_ripple(&rec.id, "alice", far),
            Err(EngineError::Validation(_))
        ));

        let stored = svc.list_for_user("alice", RecordStatus::All).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].visibility, Visibility::Private);
    }

    #[test]
    fn test_create_rejects_oversized_self_destruct() {
        let svc = service();
        let mut rec = input("Burn", UnlockCondition::Date(t0()));

        rec.self_destruct_after_secs = Some(MAX_SELF_DESTRUCT_SECS + 1);
        assert!(matches!(svc.create_record(rec.clone(), t0()), Err(EngineError::Validation(_))));
        rec.self_destruct_after_secs = Some(i64::MAX);
        assert!(matches!(svc.create_record(rec.clone(), t0()), Err(EngineError::Validation(_))));

        rec.self_destruct_after_secs = Some(MAX_SELF_DESTRUCT_SECS);
        assert!(svc.create_record(rec, t0()).is_ok());
    }

    #[test]
    fn test_echo_for_day() {
        let svc = service();
        svc.register_user("carol", t0()).unwrap();
        let day = t0().date_naive();

        let unlock = |rec: &RecordSummary, at: DateTime<Utc>| {
            svc.db
                .with_conn(|conn| records::try_unlock(conn, &rec.id, at))
                .unwrap();
        };

        let own = svc.create_record(input("own", UnlockCondition::Date(t0())), t0()).unwrap();
        unlock(&own, t0());

        let mut to_carol = input("to carol", UnlockCondition::Date(t0()));
        to_carol.recipient_id = Some("carol".into());
        let to_carol = svc.create_record(to_carol, t0()).unwrap();
        unlock(&to_carol, t0() + Duration::hours(1));

        let mut public = input("public", UnlockCondition::Date(t0()));
        public.owner_id = "bob".into();
        public.visibility = Visibility::Public;
        let public = svc.create_record(public, t0()).unwrap();
        unlock(&public, t0() + Duration::hours(2));

        let mut private = input("bob private", UnlockCondition::Date(t0()));
        private.owner_id = "bob".into();
        let private = svc.create_record(private, t0()).unwrap();
        unlock(&private, t0() + Duration::hours(3));

        let yesterday = svc.create_record(input("old", UnlockCondition::Date(t0())), t0()).unwrap();
        unlock(&yesterday, t0() - Duration::days(1));

        let still_locked = svc
            .create_record(input("later", UnlockCondition::Date(t0() + Duration::days(9))), t0())
            .unwrap();

        let titles = |viewer: &str| -> Vec<String> {
            svc.echo_for_day(viewer, day)
                .unwrap()
                .into_iter()
                .map(|e| e.record.title)
                .collect()
        };

        assert_eq!(titles("alice"), vec!["public", "to carol", "own"]);
        assert_eq!(titles("carol"), vec!["public", "to carol"]);
        assert_eq!(titles("bob"), vec!["bob private", "public"]);
        assert!(!titles("alice").contains(&still_locked.title));

        let echo = svc.echo_for_day("carol", day).unwrap();
        assert_eq!(echo[1].content, "body of to carol");
        assert_eq!(echo[1].record.view_count, 0);
    }

    #[test]
    fn test_echo_skips_undecryptable() {
        let svc = service();
        let day = t0().date_naive();

        let good = svc.create_record(input("good", UnlockCondition::Date(t0())), t0()).unwrap();
        let bad = svc.create_record(input("bad", UnlockCondition::Date(t0())), t0()).unwrap();
        svc.db
            .with_conn(|conn| {
                records::try_unlock(conn, &good.id, t0())?;
                records::try_unlock(conn, &bad.id, t0())?;
                conn.execute(
                    "UPDATE records SET cipher_tag = zeroblob(16) WHERE id = ?",
                    [&bad.id],
                )?;
                Ok(())
            })
            .unwrap();

        let echo = svc.echo_for_day("alice", day).unwrap();
        assert_eq!(echo.len(), 1);
        assert_eq!(echo[0].record.id, good.id);
        assert_eq!(echo[0].content, "body of good");
    }

    #[test]
    fn test_locked_record_hides_content() {
        let svc = service();
        let rec = svc
            .create_record(input("Letter", UnlockCondition::Date(t0() + Duration::days(1))), t0())
            .unwrap();
        assert!(rec.is_locked);
        assert_eq!(rec.emotional_tag.as_deref(), Some("happy"));

        match svc.open_record(&rec.id, "alice", t0()).unwrap() {
            RecordView::Locked { record } => assert_eq!(record.id, rec.id),
            other => panic!("expected locked view, got {:?}", other),
        }
        assert!(matches!(
            svc.open_record(&rec.id, "bob", t0()),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn test_open_unlocked_decrypts_and_counts() {
        let svc = service();
        let rec = svc
            .create_record(input("Letter", UnlockCondition::Date(t0())), t0())
            .unwrap();
        svc.db
            .with_conn(|conn| records::try_unlock(conn, &rec.id, t0()))
            .unwrap();

        match svc.open_record(&rec.id, "alice", t0()).unwrap() {
            RecordView::Unlocked { record, content } => {
                assert_eq!(content, "body of Letter");
                assert_eq!(record.view_count, 1);
            }
            other => panic!("expected unlocked view, got {:?}", other),
        }
    }

    #[test]
    fn test_create_sequence_layout() {
        let svc = service();
        let never = UnlockCondition::Event("never".into());
        let recs = svc
            .create_sequence(
                "alice",
                vec![
                    input("one", never.clone()),
                    input("two", never.clone()),
                    input("three", never),
                ],
                t0(),
            )
            .unwrap();

        assert_eq!(recs[0].parent_id, None);
        assert_eq!(recs[0].sequence_order, 1);
        assert_eq!(recs[1].parent_id.as_deref(), Some(recs[0].id.as_str()));
        assert_eq!(recs[2].sequence_order, 3);

        let mut foreign = input("x", UnlockCondition::Date(t0()));
        foreign.owner_id = "bob".into();
        assert!(svc
            .create_sequence("alice", vec![input("a", UnlockCondition::Date(t0())), foreign], t0())
            .is_err());
        assert_eq!(svc.list_for_user("alice", RecordStatus::All).unwrap().len(), 3);
    }

    #[test]
    fn test_set_ripple_owner_only() {
        let svc = service();
        let rec = svc
            .create_record(input("Letter", UnlockCondition::Date(t0())), t0())
            .unwrap();

        assert!(matches!(
            svc.set_ripple(&rec.id, "bob", t0()),
            Err(EngineError::Forbidden(_))
        ));
        assert!(svc.set_ripple(&rec.id, "alice", t0()).unwrap());
        assert!(!svc.set_ripple(&rec.id, "alice", t0()).unwrap());
    }
}
