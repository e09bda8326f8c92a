//! Time-lock unlock engine
//!
//! Seals content under a per-user key and releases it exactly once, when its
//! unlock condition is met.
//!
//! ## Architecture
//!
//! - **cipher**: ChaCha20-Poly1305 sealing of payloads
//! - **db**: SQLite store; every record state change is one conditional update
//! - **services**: scheduler, ripple expander, self-destruct sweep, collision
//!   detector, emotional aggregates, record access
//! - **worker**: periodic tokio tasks driving the services
//!
//! ## Record lifecycle
//!
//! ```text
//! Locked(condition) --sweep/check/event--> Unlocked(at) --self-destruct--> Destroyed
//!
//! visibility: private --owner--> ripple --expander--> public
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/timelock-engine/
//! ├── timelock.db      # SQLite (WAL)
//! └── config.toml      # Configuration
//! ```

pub mod cipher;
pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod worker;

pub use config::Config;
pub use db::EngineDb;
pub use error::{EngineError, Result};
pub use services::{Engine, EngineEvent, EventBus, EventPublisher};
pub use worker::{run_once, MaintenanceReport, Workers};
