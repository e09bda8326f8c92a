//! Error types for timelock-engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Payload integrity check failed. Never means "still locked".
    #[error("Cipher authentication failed")]
    CipherAuthenticationFailed,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Publication error: {0}")]
    Publication(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Store-level failure: the sweep skips the record and retries next interval.
    pub fn is_persistence(&self) -> bool {
        matches!(self, EngineError::Persistence(_) | EngineError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
