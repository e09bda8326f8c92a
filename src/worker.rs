//! Periodic workers
//!
//! Each worker is an independent tokio task on its own interval:
//!
//! | Worker    | Pass                                   | Default period |
//! |-----------|----------------------------------------|----------------|
//! | unlock    | `UnlockScheduler::sweep`               | 5 min          |
//! | ripple    | `RippleExpander::expand`               | 5 min          |
//! | destruct  | `DestructSweeper::sweep`               | 10 min         |
//! | collision | `CollisionDetector::detect_for_date`   | daily          |
//!
//! Passes do blocking SQLite work, so they run on `spawn_blocking`. A failed
//! pass is logged and the next tick tries again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::services::{CollisionReport, Engine, SweepReport};

/// Result of a single maintenance pass over every worker
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub recovered_actions: usize,
    pub unlock: SweepReport,
    pub promoted: usize,
    pub destroyed: usize,
    pub collisions: CollisionReport,
}

/// Run every pass once, in dependency order
pub fn run_once(engine: &Engine, now: DateTime<Utc>) -> Result<MaintenanceReport> {
    let recovered_actions = engine.destruct.recover_deferred_actions(now)?;
    let unlock = engine.scheduler.sweep(now)?;
    let promoted = engine.ripple.expand(now)?;
    let destroyed = engine.destruct.sweep(now)?;
    let collisions = engine
        .collisions
        .detect_for_date(previous_day(now), now)?;

    Ok(MaintenanceReport {
        recovered_actions,
        unlock,
        promoted,
        destroyed,
        collisions,
    })
}

/// The UTC calendar day before `now`; the daily pass closes out yesterday
pub fn previous_day(now: DateTime<Utc>) -> chrono::NaiveDate {
    (now - chrono::Duration::days(1)).date_naive()
}

/// Handles to the running workers
pub struct Workers {
    engine: Arc<Engine>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Workers {
    /// Spawn all periodic workers
    pub fn spawn(engine: Arc<Engine>, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut handles = Vec::new();

        let e = engine.clone();
        handles.push(tokio::spawn(run_periodic(
            "unlock",
            config.unlock_interval(),
            shutdown_tx.subscribe(),
            move || e.scheduler.sweep(Utc::now()).map(|_| ()),
        )));

        let e = engine.clone();
        handles.push(tokio::spawn(run_periodic(
            "ripple",
            config.ripple_interval(),
            shutdown_tx.subscribe(),
            move || e.ripple.expand(Utc::now()).map(|_| ()),
        )));

        let e = engine.clone();
        handles.push(tokio::spawn(run_periodic(
            "destruct",
            config.destruct_interval(),
            shutdown_tx.subscribe(),
            move || e.destruct.sweep(Utc::now()).map(|_| ()),
        )));

        let e = engine.clone();
        handles.push(tokio::spawn(run_periodic(
            "collision",
            config.collision_interval(),
            shutdown_tx.subscribe(),
            move || {
                let now = Utc::now();
                e.collisions.detect_for_date(previous_day(now), now).map(|_| ())
            },
        )));

        info!(workers = handles.len(), "Workers started");

        Self {
            engine,
            handles,
            shutdown_tx,
        }
    }

    /// Cancel in-flight sweeps and wait for every worker to exit
    pub async fn shutdown(self) {
        self.engine.cancel();
        let _ = self.shutdown_tx.send(());

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Workers stopped");
    }
}

fn run_periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    pass: F,
) -> impl Future<Output = ()> + Send + 'static
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    let pass = Arc::new(pass);

    async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pass = pass.clone();
                    match tokio::task::spawn_blocking(move || pass()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(worker = name, error = %e, "Pass failed, retrying next tick"),
                        Err(e) => error!(worker = name, error = %e, "Pass panicked"),
                    }
                }
                _ = shutdown.recv() => {
                    info!(worker = name, "Worker stopping");
                    break;
                }
            }
        }
    }
}
