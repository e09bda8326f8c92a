//! SQLite store for lockable records and everything derived from them
//!
//! ## Tables
//!
//! - `users` - Owner activity and per-user content keys
//! - `records` - Sealed payloads, unlock condition, lock state, visibility
//! - `unlock_log` - Append-only audit of unlock transitions
//! - `deferred_actions` - Durable self-destruct timers
//! - `reported_events` - External event keys for `event` conditions
//! - `collisions` - One row per (user, day) with 2+ unlocks
//! - `emotional_aggregates` - Per (user, day, tag) unlock counters
//!
//! Every state change on `records` is a single conditional statement, so
//! overlapping sweeps never need a lock beyond the connection mutex.

pub mod schema;
pub mod models;
pub mod users;
pub mod records;
pub mod unlock_log;
pub mod deferred;
pub mod collisions;
pub mod aggregates;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// SQLite database handle shared by all engine components
pub struct EngineDb {
    conn: Mutex<Connection>,
}

impl EngineDb {
    /// Open or create the engine database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Persistence(format!("Failed to open SQLite: {}", e)))?;

        // WAL for concurrent readers while sweeps write
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| EngineError::Persistence(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory().map_err(|e| {
            EngineError::Persistence(format!("Failed to open in-memory SQLite: {}", e))
        })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(|conn| schema::init_schema(conn))?;
        Ok(db)
    }

    /// Run a read operation against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Persistence(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Persistence(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                user_count: count("SELECT COUNT(*) FROM users")?,
                locked_count: count("SELECT COUNT(*) FROM records WHERE unlocked_at IS NULL")?,
                unlocked_count: count("SELECT COUNT(*) FROM records WHERE unlocked_at IS NOT NULL")?,
                pending_actions: count(
                    "SELECT COUNT(*) FROM deferred_actions WHERE completed_at IS NULL",
                )?,
                collision_count: count("SELECT COUNT(*) FROM collisions")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub user_count: u64,
    pub locked_count: u64,
    pub unlocked_count: u64,
    pub pending_actions: u64,
    pub collision_count: u64,
}

// Re-exports
pub use models::{UnlockCondition, UnlockMethod, UnlockOutcome, Visibility};
pub use records::{CreateRecordInput, RecordRow, RecordStatus, RecordSummary};
pub use collisions::CollisionRow;
pub use unlock_log::UnlockLogEntry;
