//! Emotional aggregate reads and maintenance

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::db::aggregates::{self, AggregateRow};
use crate::db::EngineDb;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmotionSummary {
    pub daily: Vec<AggregateRow>,
    /// Tag -> count over the whole range
    pub totals: BTreeMap<String, i64>,
}

pub struct EmotionService {
    db: Arc<EngineDb>,
}

impl EmotionService {
    pub fn new(db: Arc<EngineDb>) -> Self {
        Self { db }
    }

    /// Daily counters for `user_id` between `from` and `to` inclusive, plus
    /// per-tag totals
    pub fn emotions_for_range(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<EmotionSummary> {
        if from > to {
            return Err(EngineError::Validation(format!(
                "range start {} is after end {}",
                from, to
            )));
        }

        let daily = self
            .db
            .with_conn(|conn| aggregates::for_range(conn, user_id, from, to))?;

        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for row in &daily {
            *totals.entry(row.tag.clone()).or_insert(0) += row.count;
        }

        Ok(EmotionSummary { daily, totals })
    }

    /// Re-derive every counter from the unlock log
    pub fn rebuild_aggregates(&self) -> Result<usize> {
        let rows = self.db.with_conn_mut(aggregates::rebuild)?;
        info!(rows, "Emotional aggregates rebuilt");
        Ok(rows)
    }

    pub fn all(&self) -> Result<Vec<AggregateRow>> {
        self.db.with_conn(aggregates::all)
    }
}
