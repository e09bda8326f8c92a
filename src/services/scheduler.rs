//! Unlock scheduler - drives locked records to unlocked
//!
//! Every transition goes through the store's conditional update, so any
//! number of overlapping sweeps (periodic, on-demand, event-triggered) agree
//! on a single winner per record. Only the winner runs the side effects:
//!
//! 1. append the unlock log (retried, never rolled back)
//! 2. bump the emotional aggregate
//! 3. arm the self-destruct deferred action
//! 4. publish `RecordUnlocked`
//!
//! Side effects after the transition are best-effort. A failure is logged
//! and the record stays unlocked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::{
    aggregates, deferred, records, unlock_log, users, EngineDb, RecordSummary, UnlockMethod,
    UnlockOutcome,
};
use crate::error::{EngineError, Result};

use super::events::{EngineEvent, EventPublisher};

/// Actor recorded in the unlock log for scheduler-driven unlocks
pub const SYSTEM_ACTOR: &str = "system";

/// Outcome counters for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub unlocked: usize,
    pub lost_races: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct UnlockScheduler {
    db: Arc<EngineDb>,
    publisher: Arc<dyn EventPublisher>,
    log_retry_attempts: u32,
    cancel: Arc<AtomicBool>,
}

impl UnlockScheduler {
    pub fn new(
        db: Arc<EngineDb>,
        publisher: Arc<dyn EventPublisher>,
        log_retry_attempts: u32,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db,
            publisher,
            log_retry_attempts: log_retry_attempts.max(1),
            cancel,
        }
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Evaluate every locked record of every user
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let batch = self.collect_due(None, now, UnlockMethod::Scheduled)?;
        let report = self.run_batch(batch, SYSTEM_ACTOR, now);
        log_report("Unlock sweep", &report);
        Ok(report)
    }

    /// On-demand check for one user's records
    pub fn check_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        if self.db.with_conn(|conn| users::get_user(conn, user_id))?.is_none() {
            return Err(EngineError::NotFound(format!("user {}", user_id)));
        }

        let batch = self.collect_due(Some(user_id), now, UnlockMethod::Manual)?;
        let report = self.run_batch(batch, user_id, now);
        debug!(user_id = %user_id, unlocked = report.unlocked, "User check complete");
        Ok(report)
    }

    /// Persist an external event key and unlock every record waiting on a
    /// reported key
    pub fn report_event(&self, key: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        let key = key.trim();
        if key.is_empty() {
            return Err(EngineError::Validation("event key is required".into()));
        }

        let fresh = self
            .db
            .with_conn(|conn| records::report_event_key(conn, key, now))?;
        if !fresh {
            debug!(event_key = %key, "Event key already reported");
        }

        let candidates = self.db.with_conn(|conn| records::event_candidates(conn, None))?;
        let batch = candidates
            .into_iter()
            .map(|rec| (rec, UnlockMethod::Scheduled))
            .collect();
        let report = self.run_batch(batch, SYSTEM_ACTOR, now);
        log_report("Event sweep", &report);
        Ok(report)
    }

    /// Unlock the next record of a sequence. Returns the unlocked id, or
    /// `None` when the parent is still locked or nothing is left.
    pub fn advance_sequence(&self, parent_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let parent = self
            .db
            .with_conn(|conn| records::get_record(conn, parent_id))?
            .ok_or_else(|| EngineError::NotFound(format!("record {}", parent_id)))?;

        if parent.is_locked() {
            debug!(parent_id = %parent_id, "Sequence parent still locked");
            return Ok(None);
        }

        let child = match self
            .db
            .with_conn(|conn| records::next_sequence_child(conn, parent_id))?
        {
            Some(child) => child,
            None => return Ok(None),
        };

        let outcome = self.db.with_conn(|conn| {
            records::try_unlock_in_sequence(conn, &child.id, now)
        })?;

        match outcome {
            UnlockOutcome::Unlocked => {
                self.after_unlock(&child, UnlockMethod::Manual, SYSTEM_ACTOR, now);
                Ok(Some(child.id))
            }
            UnlockOutcome::LostRace => {
                debug!(record_id = %child.id, "Sequence advance lost race");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Collect satisfied records. `date_method` is used for date and event
    /// conditions; inactivity always logs as `inactivity`.
    fn collect_due(
        &self,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
        date_method: UnlockMethod,
    ) -> Result<Vec<(RecordSummary, UnlockMethod)>> {
        self.db.with_conn(|conn| {
            let mut batch: Vec<(RecordSummary, UnlockMethod)> = records::due_date_candidates(conn, now, owner_id)?
                .into_iter()
                .map(|rec| (rec, date_method))
                .collect();

            for (rec, days, last_seen) in records::inactivity_candidates(conn, owner_id)? {
                if inactivity_satisfied(last_seen, days, now) {
                    batch.push((rec, UnlockMethod::Inactivity));
                }
            }

            batch.extend(
                records::event_candidates(conn, owner_id)?
                    .into_iter()
                    .map(|rec| (rec, date_method)),
            );

            Ok(batch)
        })
    }

    fn run_batch(
        &self,
        batch: Vec<(RecordSummary, UnlockMethod)>,
        unlocked_by: &str,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        for (rec, method) in batch {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Sweep cancelled");
                report.cancelled = true;
                break;
            }

            report.evaluated += 1;
            match self.unlock_one(&rec, method, unlocked_by, now) {
                Ok(UnlockOutcome::Unlocked) => report.unlocked += 1,
                Ok(UnlockOutcome::LostRace) => report.lost_races += 1,
                Err(e) if e.is_persistence() => {
                    warn!(record_id = %rec.id, error = %e, "Unlock attempt failed, will retry next sweep");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(record_id = %rec.id, error = %e, "Unlock attempt rejected");
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn unlock_one(
        &self,
        rec: &RecordSummary,
        method: UnlockMethod,
        unlocked_by: &str,
        now: DateTime<Utc>,
    ) -> Result<UnlockOutcome> {
        let outcome = self.db.with_conn(|conn| records::try_unlock(conn, &rec.id, now))?;

        match outcome {
            UnlockOutcome::Unlocked => self.after_unlock(rec, method, unlocked_by, now),
            UnlockOutcome::LostRace => {
                debug!(record_id = %rec.id, "Record already unlocked elsewhere");
            }
        }

        Ok(outcome)
    }

    /// Side effects owned by the winner of a transition
    fn after_unlock(
        &self,
        rec: &RecordSummary,
        method: UnlockMethod,
        unlocked_by: &str,
        at: DateTime<Utc>,
    ) {
        self.append_log(rec, method, unlocked_by, at);

        if let Some(ref tag) = rec.emotional_tag {
            if let Err(e) = self.db.with_conn(|conn| {
                aggregates::increment(conn, &rec.owner_id, at.date_naive(), tag)
            }) {
                warn!(record_id = %rec.id, error = %e, "Failed to update emotional aggregate");
            }
        }

        if let Some(secs) = rec.self_destruct_after_secs {
            match deferred::destroy_at(at, secs) {
                Ok(fire_at) => {
                    if let Err(e) = self.db.with_conn(|conn| {
                        deferred::schedule(conn, &rec.id, deferred::ACTION_DESTROY, fire_at, at)
                    }) {
                        // Re-armed by recover_deferred_actions on next start
                        warn!(record_id = %rec.id, error = %e, "Failed to arm self-destruct");
                    }
                }
                Err(e) => {
                    error!(record_id = %rec.id, error = %e, "Self-destruct delay out of range, not armed");
                }
            }
        }

        let event = EngineEvent::RecordUnlocked {
            record_id: rec.id.clone(),
            owner_id: rec.owner_id.clone(),
            title: rec.title.clone(),
            emotional_tag: rec.emotional_tag.clone(),
            method,
        };
        if let Err(e) = self.publisher.publish(&event) {
            warn!(record_id = %rec.id, error = %e, "Failed to publish unlock event");
        }
    }

    fn append_log(&self, rec: &RecordSummary, method: UnlockMethod, unlocked_by: &str, at: DateTime<Utc>) {
        for attempt in 1..=self.log_retry_attempts {
            match self
                .db
                .with_conn(|conn| unlock_log::append(conn, &rec.id, unlocked_by, method, at))
            {
                Ok(_) => return,
                Err(e) if attempt < self.log_retry_attempts => {
                    warn!(record_id = %rec.id, attempt, error = %e, "Unlock log append failed, retrying");
                }
                Err(e) => {
                    error!(record_id = %rec.id, error = %e, "Unlock log append failed, giving up");
                }
            }
        }
    }
}

/// `now - last_seen >= days`
pub fn inactivity_satisfied(last_seen: DateTime<Utc>, days: u32, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_seen) >= Duration::days(i64::from(days))
}

pub(crate) fn log_report(what: &str, report: &SweepReport) {
    if report.unlocked > 0 || report.failed > 0 {
        info!(
            evaluated = report.evaluated,
            unlocked = report.unlocked,
            lost_races = report.lost_races,
            failed = report.failed,
            "{} complete",
            what
        );
    } else {
        debug!(evaluated = report.evaluated, "{} found nothing to do", what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_inactivity_boundary() {
        let seen = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(!inactivity_satisfied(seen, 30, seen + Duration::days(29)));
        assert!(inactivity_satisfied(seen, 30, seen + Duration::days(30)));
        assert!(inactivity_satisfied(seen, 30, seen + Duration::days(40)));
    }
}
