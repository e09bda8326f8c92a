//! Engine events and their fan-out
//!
//! The engine only depends on [`EventPublisher`]. Delivery is at-least-once
//! from the engine's side: a failed publish is logged and the state change
//! it describes stays committed.
//!
//! [`EventBus`] is the in-process publisher, backed by a broadcast channel.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::{UnlockMethod, Visibility};
use crate::error::Result;

/// Events emitted by the engine's workers and services
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RecordUnlocked {
        record_id: String,
        owner_id: String,
        title: String,
        emotional_tag: Option<String>,
        method: UnlockMethod,
    },
    CollisionDetected {
        user_id: String,
        date: NaiveDate,
        theme: String,
        record_ids: Vec<String>,
    },
    RecordDestroyed {
        record_id: String,
        owner_id: String,
    },
    VisibilityExpanded {
        record_id: String,
        owner_id: String,
        visibility: Visibility,
    },
}

/// Outbound notification seam
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &EngineEvent) -> Result<()>;
}

/// Broadcast-backed publisher
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = ?event, "Emitting engine event");
        // No subscribers is not a failure
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: &EngineEvent) -> Result<()> {
        self.emit(event.clone());
        Ok(())
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RecordUnlocked {
            record_id,
            owner_id,
            method,
            ..
        } => {
            info!(record_id = %record_id, owner_id = %owner_id, method = method.as_str(), "Record unlocked");
        }
        EngineEvent::CollisionDetected {
            user_id,
            date,
            theme,
            record_ids,
        } => {
            info!(user_id = %user_id, date = %date, theme = %theme, records = record_ids.len(), "Collision detected");
        }
        EngineEvent::RecordDestroyed { record_id, .. } => {
            debug!(record_id = %record_id, "Record destroyed");
        }
        EngineEvent::VisibilityExpanded {
            record_id,
            visibility,
            ..
        } => {
            debug!(record_id = %record_id, visibility = visibility.as_str(), "Visibility expanded");
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
