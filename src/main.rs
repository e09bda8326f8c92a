//! Time-lock engine daemon
//!
//! Opens the record store and runs the unlock, ripple, self-destruct and
//! collision workers until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! timelock-engine
//!
//! # Start with custom config
//! timelock-engine --config /path/to/config.toml
//!
//! # Custom storage directory
//! timelock-engine --storage-dir /data/timelock
//!
//! # Run every pass once and exit (cron style)
//! timelock-engine --once
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use timelock_engine::services::spawn_logging_listener;
use timelock_engine::{run_once, Config, Engine, EngineDb, Workers};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "timelock-engine")]
#[command(about = "Time-lock unlock engine for sealed records")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "TIMELOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory (database and default config)
    #[arg(long, env = "TIMELOCK_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Run one pass of every worker, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("timelock_engine=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        unlock_interval_secs = config.unlock_interval_secs,
        "Starting timelock-engine"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(EngineDb::open(&config.database_path())?);
    let engine = Arc::new(Engine::new(db.clone(), &config));
    let listener = spawn_logging_listener(engine.events.clone());

    if args.once {
        let pass_engine = engine.clone();
        let report = tokio::task::spawn_blocking(move || run_once(&pass_engine, Utc::now())).await??;
        info!(
            recovered = report.recovered_actions,
            unlocked = report.unlock.unlocked,
            promoted = report.promoted,
            destroyed = report.destroyed,
            collisions = report.collisions.created + report.collisions.updated,
            "Maintenance pass complete"
        );
    } else {
        // Close out any self-destruct armed before a crash
        let recover_engine = engine.clone();
        tokio::task::spawn_blocking(move || {
            recover_engine.destruct.recover_deferred_actions(Utc::now())
        })
        .await??;

        let workers = Workers::spawn(engine.clone(), &config);

        info!("Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");

        workers.shutdown().await;
    }

    listener.abort();

    // Print stats before exit
    if let Ok(stats) = db.stats() {
        info!(
            users = stats.user_count,
            locked = stats.locked_count,
            unlocked = stats.unlocked_count,
            pending_actions = stats.pending_actions,
            collisions = stats.collision_count,
            "Final store stats"
        );
    }

    Ok(())
}
