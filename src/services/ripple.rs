//! Ripple expander: ripple -> public once the expansion time passes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::{records, EngineDb, Visibility};
use crate::error::Result;

use super::events::{EngineEvent, EventPublisher};

pub struct RippleExpander {
    db: Arc<EngineDb>,
    publisher: Arc<dyn EventPublisher>,
    cancel: Arc<AtomicBool>,
}

impl RippleExpander {
    pub fn new(db: Arc<EngineDb>, publisher: Arc<dyn EventPublisher>, cancel: Arc<AtomicBool>) -> Self {
        Self { db, publisher, cancel }
    }

    /// Promote every due ripple record. Locked records are never touched.
    /// Returns the number promoted by this call.
    pub fn expand(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.db.with_conn(|conn| records::ripple_due(conn, now))?;

        let mut promoted = 0;
        for rec in due {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Ripple sweep cancelled");
                break;
            }

            match self.db.with_conn(|conn| records::promote_to_public(conn, &rec.id, now)) {
                Ok(true) => {
                    promoted += 1;
                    let event = EngineEvent::VisibilityExpanded {
                        record_id: rec.id.clone(),
                        owner_id: rec.owner_id.clone(),
                        visibility: Visibility::Public,
                    };
                    if let Err(e) = self.publisher.publish(&event) {
                        warn!(record_id = %rec.id, error = %e, "Failed to publish visibility event");
                    }
                }
                Ok(false) => debug!(record_id = %rec.id, "Ripple already expanded"),
                Err(e) => warn!(record_id = %rec.id, error = %e, "Ripple promotion failed"),
            }
        }

        if promoted > 0 {
            info!(promoted, "Ripple sweep complete");
        }
        Ok(promoted)
    }
}
