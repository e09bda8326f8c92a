//! Self-destruct sweep over durable deferred actions

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::{deferred, records, EngineDb};
use crate::error::Result;

use super::events::{EngineEvent, EventPublisher};

pub struct DestructSweeper {
    db: Arc<EngineDb>,
    publisher: Arc<dyn EventPublisher>,
    cancel: Arc<AtomicBool>,
}

impl DestructSweeper {
    pub fn new(db: Arc<EngineDb>, publisher: Arc<dyn EventPublisher>, cancel: Arc<AtomicBool>) -> Self {
        Self { db, publisher, cancel }
    }

    /// Destroy every record whose self-destruct time has passed. Returns the
    /// number of records deleted.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .db
            .with_conn(|conn| deferred::due(conn, deferred::ACTION_DESTROY, now))?;

        let mut destroyed = 0;
        for action in due {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Destruct sweep cancelled");
                break;
            }

            let result = self.db.with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                let owner = records::get_record(&tx, &action.record_id)?.map(|r| r.owner_id);
                let deleted = records::delete_record(&tx, &action.record_id)?;
                deferred::complete(&tx, action.id, now)?;
                tx.commit()?;
                Ok(owner.filter(|_| deleted))
            });

            match result {
                Ok(Some(owner_id)) => {
                    destroyed += 1;
                    let event = EngineEvent::RecordDestroyed {
                        record_id: action.record_id.clone(),
                        owner_id,
                    };
                    if let Err(e) = self.publisher.publish(&event) {
                        warn!(record_id = %action.record_id, error = %e, "Failed to publish destroy event");
                    }
                }
                Ok(None) => {
                    debug!(record_id = %action.record_id, "Record already gone, action closed");
                }
                Err(e) => {
                    warn!(record_id = %action.record_id, error = %e, "Self-destruct failed, will retry");
                }
            }
        }

        if destroyed > 0 {
            info!(destroyed, "Destruct sweep complete");
        }
        Ok(destroyed)
    }

    /// Arm actions for unlocked records that should self-destruct but have no
    /// action (crash between unlock and arm). Returns the number armed.
    pub fn recover_deferred_actions(&self, now: DateTime<Utc>) -> Result<usize> {
        let missing = self.db.with_conn(records::missing_destruct_actions)?;

        let mut armed = 0;
        for rec in missing {
            let (Some(unlocked_at), Some(secs)) = (rec.unlocked_at, rec.self_destruct_after_secs) else {
                continue;
            };
            let fire_at = match deferred::destroy_at(unlocked_at, secs) {
                Ok(fire_at) => fire_at,
                Err(e) => {
                    warn!(record_id = %rec.id, error = %e, "Skipping self-destruct with out-of-range delay");
                    continue;
                }
            };
            if self.db.with_conn(|conn| {
                deferred::schedule(conn, &rec.id, deferred::ACTION_DESTROY, fire_at, now)
            })? {
                armed += 1;
            }
        }

        if armed > 0 {
            info!(armed, "Recovered missing self-destruct actions");
        }
        Ok(armed)
    }
}
