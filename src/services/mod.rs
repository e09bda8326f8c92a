//! Service layer for timelock-engine
//!
//! Services hold the engine's business rules on top of the store. Each one
//! wraps database operations with:
//! - Input validation
//! - Conditional state transitions
//! - Event publication
//!
//! ## Architecture
//!
//! ```text
//! Workers (periodic) / callers (on demand)
//!     ↓
//! Service Layer (business logic)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod record_service;
pub mod scheduler;
pub mod destruct;
pub mod ripple;
pub mod collisions;
pub mod emotions;

// Re-exports
pub use collisions::{CollisionDetector, CollisionInsights, CollisionReport, CollisionWall, SerendipityGroup};
pub use destruct::DestructSweeper;
pub use emotions::{EmotionService, EmotionSummary};
pub use events::{spawn_logging_listener, EngineEvent, EventBus, EventPublisher};
pub use record_service::{EchoEntry, RecordService, RecordView};
pub use ripple::RippleExpander;
pub use scheduler::{SweepReport, UnlockScheduler};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::db::EngineDb;

/// Service container
///
/// Holds every service over one shared database and one publisher, plus the
/// cancellation flag the sweeps check between records.
pub struct Engine {
    pub db: Arc<EngineDb>,
    pub events: Arc<EventBus>,
    pub records: Arc<RecordService>,
    pub scheduler: Arc<UnlockScheduler>,
    pub destruct: Arc<DestructSweeper>,
    pub ripple: Arc<RippleExpander>,
    pub collisions: Arc<CollisionDetector>,
    pub emotions: Arc<EmotionService>,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    /// Create all services, publishing onto an in-process event bus
    pub fn new(db: Arc<EngineDb>, config: &Config) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));
        let publisher: Arc<dyn EventPublisher> = events.clone();
        Self::build(db, events, publisher, config.log_retry_attempts)
    }

    /// Create all services with an external publisher. `events` stays empty.
    pub fn with_publisher(
        db: Arc<EngineDb>,
        publisher: Arc<dyn EventPublisher>,
        config: &Config,
    ) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));
        Self::build(db, events, publisher, config.log_retry_attempts)
    }

    fn build(
        db: Arc<EngineDb>,
        events: Arc<EventBus>,
        publisher: Arc<dyn EventPublisher>,
        log_retry_attempts: u32,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));

        Self {
            records: Arc::new(RecordService::new(db.clone())),
            scheduler: Arc::new(UnlockScheduler::new(
                db.clone(),
                publisher.clone(),
                log_retry_attempts,
                cancel.clone(),
            )),
            destruct: Arc::new(DestructSweeper::new(db.clone(), publisher.clone(), cancel.clone())),
            ripple: Arc::new(RippleExpander::new(db.clone(), publisher.clone(), cancel.clone())),
            collisions: Arc::new(CollisionDetector::new(db.clone(), publisher)),
            emotions: Arc::new(EmotionService::new(db.clone())),
            events,
            db,
            cancel,
        }
    }

    /// Ask running sweeps to stop at the next record boundary
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
