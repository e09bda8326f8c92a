//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::{EngineError, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| EngineError::Persistence(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(USERS_SCHEMA)
        .map_err(|e| EngineError::Persistence(format!("Failed to create users table: {}", e)))?;

    conn.execute_batch(RECORDS_SCHEMA)
        .map_err(|e| EngineError::Persistence(format!("Failed to create record tables: {}", e)))?;

    conn.execute_batch(DERIVED_SCHEMA)
        .map_err(|e| EngineError::Persistence(format!("Failed to create derived tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| EngineError::Persistence(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Mirror of identity inputs from the auth layer
const USERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY NOT NULL,
    -- Random per-user content key, never derived from the password
    content_key BLOB NOT NULL,
    last_active_at TEXT,
    created_at TEXT NOT NULL
);
"#;

const RECORDS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY NOT NULL,
    owner_id TEXT NOT NULL,
    recipient_id TEXT,
    parent_id TEXT,
    sequence_order INTEGER NOT NULL DEFAULT 1,
    title TEXT NOT NULL,

    -- Sealed payload; plaintext is never stored
    sealed_payload BLOB NOT NULL,
    cipher_algorithm TEXT NOT NULL,
    cipher_nonce BLOB NOT NULL,
    cipher_tag BLOB NOT NULL,

    -- Unlock condition (exactly one value column is set per kind)
    condition_type TEXT NOT NULL CHECK (condition_type IN ('date', 'inactivity', 'event')),
    condition_at TEXT,
    condition_days INTEGER,
    condition_key TEXT,

    -- Lock state: locked while unlocked_at IS NULL
    unlocked_at TEXT,
    view_count INTEGER NOT NULL DEFAULT 0 CHECK (view_count >= 0),

    visibility TEXT NOT NULL DEFAULT 'private'
        CHECK (visibility IN ('private', 'ripple', 'public')),
    ripple_expand_at TEXT,

    self_destruct_after_secs INTEGER,
    emotional_tag TEXT,
    created_at TEXT NOT NULL,

    UNIQUE (owner_id, cipher_nonce),
    FOREIGN KEY (owner_id) REFERENCES users(user_id)
);

-- Sequence order is unique within a parent
CREATE UNIQUE INDEX IF NOT EXISTS idx_records_sequence
    ON records(parent_id, sequence_order) WHERE parent_id IS NOT NULL;

-- Append-only audit of unlock transitions, one per record
CREATE TABLE IF NOT EXISTS unlock_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE,
    unlocked_by TEXT NOT NULL,
    method TEXT NOT NULL CHECK (method IN ('scheduled', 'manual', 'inactivity')),
    unlocked_at TEXT NOT NULL
);

-- Durable self-destruct (and future) deferred actions
CREATE TABLE IF NOT EXISTS deferred_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL,
    action TEXT NOT NULL,
    fire_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    UNIQUE (record_id, action)
);

-- External event keys reported for event conditions
CREATE TABLE IF NOT EXISTS reported_events (
    event_key TEXT PRIMARY KEY NOT NULL,
    reported_at TEXT NOT NULL
);
"#;

const DERIVED_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collision_date TEXT NOT NULL,
    user_id TEXT NOT NULL,
    record_ids_json TEXT NOT NULL,
    dominant_tag TEXT,
    theme TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, collision_date)
);

CREATE TABLE IF NOT EXISTS emotional_aggregates (
    user_id TEXT NOT NULL,
    date TEXT NOT NULL,
    tag TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, date, tag)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_records_owner ON records(owner_id);
CREATE INDEX IF NOT EXISTS idx_records_locked_date
    ON records(condition_type, condition_at) WHERE unlocked_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_records_condition_key ON records(condition_key);
CREATE INDEX IF NOT EXISTS idx_records_unlocked_at ON records(unlocked_at);
CREATE INDEX IF NOT EXISTS idx_records_ripple ON records(visibility, ripple_expand_at);
CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent_id);

CREATE INDEX IF NOT EXISTS idx_deferred_pending ON deferred_actions(fire_at) WHERE completed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_collisions_user ON collisions(user_id, collision_date);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('users', 'records', 'unlock_log', 'deferred_actions', 'reported_events', \
                  'collisions', 'emotional_aggregates')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }
}
