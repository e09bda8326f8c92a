//! Collision detector - same-day unlock aggregation
//!
//! A collision is two or more of one user's records unlocking on the same
//! UTC calendar day. Detection is a batch pass per day and is idempotent:
//! re-running it for an unchanged day writes nothing and notifies nobody.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::collisions::{self, CollisionChange};
use crate::db::models::format_day;
use crate::db::{records, CollisionRow, EngineDb, RecordSummary};
use crate::error::Result;

use super::events::{EngineEvent, EventPublisher};

/// Tie-break order for the dominant tag; unknown tags follow in lexical order
const TAG_PRIORITY: [&str; 6] = ["happy", "love", "hope", "proud", "wisdom", "regret"];

/// Dominant-tag value when no record carries a tag
pub const MIXED: &str = "mixed";

/// Human label for a dominant tag
pub fn theme_label(tag: &str) -> &'static str {
    match tag {
        "happy" => "Joyful Convergence",
        "love" => "Love Collision",
        "regret" => "Reflection Nexus",
        "proud" => "Achievement Alignment",
        "hope" => "Future Visions",
        "wisdom" => "Wisdom Convergence",
        _ => "Emotional Kaleidoscope",
    }
}

/// Majority tag of a multiset. Ties go to the higher-priority tag, then to
/// the lexically smaller one. `None` when nothing is tagged.
pub fn dominant_tag<'a, I>(tags: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for tag in tags {
        *counts.entry(tag).or_default() += 1;
    }

    let rank = |tag: &str| {
        TAG_PRIORITY
            .iter()
            .position(|p| *p == tag)
            .unwrap_or(TAG_PRIORITY.len())
    };

    counts
        .into_iter()
        .max_by(|(a_tag, a_n), (b_tag, b_n)| {
            a_n.cmp(b_n)
                .then_with(|| rank(b_tag).cmp(&rank(a_tag)))
                .then_with(|| b_tag.cmp(a_tag))
        })
        .map(|(tag, _)| tag.to_string())
}

/// Counters for one detection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollisionReport {
    pub users: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Public same-day unlocks sharing a tag across distinct users
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerendipityGroup {
    pub tag: String,
    pub user_ids: Vec<String>,
    pub record_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollisionWall {
    pub collision: CollisionRow,
    pub records: Vec<RecordSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekdayPattern {
    pub weekday: String,
    pub frequency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollisionInsights {
    pub total_collisions: usize,
    pub themes: BTreeMap<String, usize>,
    pub weekday_pattern: Option<WeekdayPattern>,
}

pub struct CollisionDetector {
    db: Arc<EngineDb>,
    publisher: Arc<dyn EventPublisher>,
}

impl CollisionDetector {
    pub fn new(db: Arc<EngineDb>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { db, publisher }
    }

    /// Detect and upsert collisions for one calendar day
    pub fn detect_for_date(&self, day: NaiveDate, now: DateTime<Utc>) -> Result<CollisionReport> {
        let day_key = format_day(day);
        let unlocked = self.db.with_conn(|conn| records::unlocked_on_day(conn, &day_key))?;

        let mut by_user: BTreeMap<String, Vec<RecordSummary>> = BTreeMap::new();
        for rec in unlocked {
            by_user.entry(rec.owner_id.clone()).or_default().push(rec);
        }

        let mut report = CollisionReport::default();
        for (user_id, recs) in by_user {
            // Below the threshold existing rows are left as they are
            if recs.len() < 2 {
                continue;
            }
            report.users += 1;

            let mut ids: Vec<String> = recs.iter().map(|r| r.id.clone()).collect();
            ids.sort();
            let dominant = dominant_tag(recs.iter().filter_map(|r| r.emotional_tag.as_deref()));
            let theme = theme_label(dominant.as_deref().unwrap_or(MIXED));

            let change = self.db.with_conn(|conn| {
                collisions::upsert(conn, &user_id, day, &ids, dominant.as_deref(), theme, now)
            });

            match change {
                Ok(change) => {
                    match change {
                        CollisionChange::Created => report.created += 1,
                        CollisionChange::RecordsChanged | CollisionChange::ThemeChanged => {
                            report.updated += 1
                        }
                        CollisionChange::Unchanged => report.unchanged += 1,
                    }

                    if change.should_notify() {
                        let event = EngineEvent::CollisionDetected {
                            user_id: user_id.clone(),
                            date: day,
                            theme: theme.to_string(),
                            record_ids: ids.clone(),
                        };
                        if let Err(e) = self.publisher.publish(&event) {
                            warn!(user_id = %user_id, error = %e, "Failed to publish collision event");
                        }
                    }
                }
                Err(e) => {
                    warn!(user_id = %user_id, date = %day, error = %e, "Collision upsert failed");
                    report.failed += 1;
                }
            }
        }

        if report.created > 0 || report.updated > 0 {
            info!(date = %day, created = report.created, updated = report.updated, "Collision detection complete");
        } else {
            debug!(date = %day, users = report.users, "No collision changes");
        }
        Ok(report)
    }

    /// Public tagged unlocks of `day` grouped by tag, keeping tags shared by at
    /// least two distinct users. `exclude_user` drops that user's records.
    pub fn serendipity(
        &self,
        day: NaiveDate,
        exclude_user: Option<&str>,
    ) -> Result<Vec<SerendipityGroup>> {
        let rows = self.db.with_conn(|conn| collisions::public_tagged_unlocks(conn, day))?;

        let mut groups: BTreeMap<String, (BTreeSet<String>, Vec<String>)> = BTreeMap::new();
        for (tag, owner_id, record_id) in rows {
            if exclude_user == Some(owner_id.as_str()) {
                continue;
            }
            let entry = groups.entry(tag).or_default();
            entry.0.insert(owner_id);
            entry.1.push(record_id);
        }

        Ok(groups
            .into_iter()
            .filter(|(_, (users, _))| users.len() >= 2)
            .map(|(tag, (users, record_ids))| SerendipityGroup {
                tag,
                user_ids: users.into_iter().collect(),
                record_ids,
            })
            .collect())
    }

    /// A user's collision for `day` together with its records
    pub fn collision_wall(&self, user_id: &str, day: NaiveDate) -> Result<Option<CollisionWall>> {
        self.db.with_conn(|conn| {
            let collision = match collisions::get(conn, user_id, day)? {
                Some(c) => c,
                None => return Ok(None),
            };
            let records = records::get_summaries(conn, &collision.record_ids)?;
            Ok(Some(CollisionWall { collision, records }))
        })
    }

    pub fn history(&self, user_id: &str, limit: u32) -> Result<Vec<CollisionRow>> {
        self.db.with_conn(|conn| collisions::history(conn, user_id, limit))
    }

    /// Theme counts and the busiest weekday over the last `since_days` days
    pub fn insights(
        &self,
        user_id: &str,
        since_days: u32,
        now: DateTime<Utc>,
    ) -> Result<CollisionInsights> {
        let from = (now - Duration::days(i64::from(since_days))).date_naive();
        let rows = self.db.with_conn(|conn| collisions::since(conn, user_id, from))?;

        let mut themes: BTreeMap<String, usize> = BTreeMap::new();
        let mut weekdays: BTreeMap<u32, usize> = BTreeMap::new();
        for row in &rows {
            *themes.entry(row.theme.clone()).or_default() += 1;
            *weekdays
                .entry(row.date.weekday().num_days_from_sunday())
                .or_default() += 1;
        }

        // Earliest weekday wins a tie
        let busiest = weekdays
            .iter()
            .max_by(|(a_day, a_n), (b_day, b_n)| a_n.cmp(b_n).then_with(|| b_day.cmp(a_day)));

        let weekday_pattern = match busiest {
            Some((day, n)) if *n > 1 => Some(WeekdayPattern {
                weekday: weekday_name(*day).to_string(),
                frequency: *n,
            }),
            _ => None,
        };

        Ok(CollisionInsights {
            total_collisions: rows.len(),
            themes,
            weekday_pattern,
        })
    }
}

fn weekday_name(days_from_sunday: u32) -> &'static str {
    const NAMES: [&str; 7] = [
        "Sunday", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday",
    ];
    NAMES[(days_from_sunday % 7) as usize]
}
