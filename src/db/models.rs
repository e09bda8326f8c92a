//! Domain types shared by the store and the services

use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ============================================================================
// Timestamps
// ============================================================================

/// Fixed-width RFC 3339 in UTC with microseconds, so that string order is
/// chronological order inside SQLite.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Reject instants `format_ts` cannot render at fixed width (years outside
/// 0000..=9999 gain a sign and extra digits and break string ordering).
pub fn check_storable(ts: DateTime<Utc>, field: &str) -> Result<()> {
    if (0..=9999).contains(&ts.year()) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "{} year {} is out of range (0000-9999)",
            field,
            ts.year()
        )))
    }
}

pub fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| EngineError::Persistence(format!("Bad timestamp '{}': {}", value, e)))
}

/// Calendar day key (`YYYY-MM-DD`) used by collisions and aggregates
pub fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

pub fn parse_day(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| EngineError::Validation(format!("Bad date '{}': {}", value, e)))
}

// ============================================================================
// Unlock condition
// ============================================================================

/// Release condition attached to a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UnlockCondition {
    /// Unlock once `now >= at`
    Date(DateTime<Utc>),
    /// Unlock once the owner has been inactive for this many days
    Inactivity(u32),
    /// Unlock once this external event key has been reported
    Event(String),
}

/// Persisted column layout of a condition
pub(crate) struct ConditionColumns {
    pub kind: &'static str,
    pub at: Option<String>,
    pub days: Option<i64>,
    pub key: Option<String>,
}

impl UnlockCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            UnlockCondition::Date(_) => "date",
            UnlockCondition::Inactivity(_) => "inactivity",
            UnlockCondition::Event(_) => "event",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            UnlockCondition::Date(at) => check_storable(*at, "unlock date"),
            UnlockCondition::Inactivity(0) => Err(EngineError::Validation(
                "inactivity threshold must be at least 1 day".into(),
            )),
            UnlockCondition::Inactivity(days) if *days > 36_500 => Err(EngineError::Validation(
                format!("inactivity threshold {} days is out of range", days),
            )),
            UnlockCondition::Inactivity(_) => Ok(()),
            UnlockCondition::Event(key) if key.trim().is_empty() => {
                Err(EngineError::Validation("event key is required".into()))
            }
            UnlockCondition::Event(key) if key.len() > 255 => Err(EngineError::Validation(
                "event key must be <= 255 characters".into(),
            )),
            UnlockCondition::Event(_) => Ok(()),
        }
    }

    pub(crate) fn to_columns(&self) -> ConditionColumns {
        match self {
            UnlockCondition::Date(at) => ConditionColumns {
                kind: "date",
                at: Some(format_ts(*at)),
                days: None,
                key: None,
            },
            UnlockCondition::Inactivity(days) => ConditionColumns {
                kind: "inactivity",
                at: None,
                days: Some(i64::from(*days)),
                key: None,
            },
            UnlockCondition::Event(key) => ConditionColumns {
                kind: "event",
                at: None,
                days: None,
                key: Some(key.clone()),
            },
        }
    }

    pub(crate) fn from_columns(
        kind: &str,
        at: Option<String>,
        days: Option<i64>,
        key: Option<String>,
    ) -> Result<Self> {
        match (kind, at, days, key) {
            ("date", Some(at), _, _) => Ok(UnlockCondition::Date(parse_ts(&at)?)),
            ("inactivity", _, Some(days), _) => u32::try_from(days)
                .map(UnlockCondition::Inactivity)
                .map_err(|_| EngineError::Persistence(format!("Bad inactivity days: {}", days))),
            ("event", _, _, Some(key)) => Ok(UnlockCondition::Event(key)),
            (kind, ..) => Err(EngineError::Persistence(format!(
                "Incomplete condition columns for kind '{}'",
                kind
            ))),
        }
    }
}

// ============================================================================
// Visibility
// ============================================================================

/// Visibility tier. Only ever moves forward: private -> ripple -> public.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Ripple,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Ripple => "ripple",
            Visibility::Public => "public",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "private" => Ok(Visibility::Private),
            "ripple" => Ok(Visibility::Ripple),
            "public" => Ok(Visibility::Public),
            other => Err(EngineError::Validation(format!(
                "visibility '{}' is not valid. Valid values: [\"private\", \"ripple\", \"public\"]",
                other
            ))),
        }
    }
}

// ============================================================================
// Unlock method
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMethod {
    /// Periodic sweep
    Scheduled,
    /// Client-triggered check or sequence advance
    Manual,
    /// Owner inactivity threshold reached
    Inactivity,
}

impl UnlockMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockMethod::Scheduled => "scheduled",
            UnlockMethod::Manual => "manual",
            UnlockMethod::Inactivity => "inactivity",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "scheduled" => Ok(UnlockMethod::Scheduled),
            "manual" => Ok(UnlockMethod::Manual),
            "inactivity" => Ok(UnlockMethod::Inactivity),
            other => Err(EngineError::Persistence(format!("Unknown unlock method: {}", other))),
        }
    }
}

/// Result of a single conditional transition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// This caller performed the transition
    Unlocked,
    /// Someone else got there first, or the record is gone
    LostRace,
}
