//! Background maintenance: periodic leaderboard rebuilds and dirty-row
//! flushes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::clock::next_week_start;
use crate::engine::GamificationEngine;

/// Spawn the rebuild and flush loops.
///
/// Both stop when `shutdown` fires (or its sender is dropped).
pub fn spawn_background_tasks(
    engine: Arc<GamificationEngine>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_rebuild_task(engine.clone(), shutdown.subscribe()),
        spawn_flush_task(engine, shutdown.subscribe()),
    ]
}

/// Rebuild on the configured interval, and at every week boundary so the
/// weekly scope resets on time.
pub fn spawn_rebuild_task(
    engine: Arc<GamificationEngine>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let every = engine.config().leaderboard.rebuild_interval();
    info!(interval_secs = every.as_secs(), "Leaderboard rebuild task started");

    tokio::spawn(async move {
        loop {
            let wait = next_rebuild_delay(&engine, every);
            tokio::select! {
                _ = sleep(wait) => {
                    if let Err(e) = engine.rebuild().await {
                        error!(error = %e, "Scheduled leaderboard rebuild failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Leaderboard rebuild task shutting down");
                    break;
                }
            }
        }
    })
}

pub fn spawn_flush_task(
    engine: Arc<GamificationEngine>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let every = engine.config().leaderboard.flush_interval();
    info!(interval_ms = every.as_millis() as u64, "Leaderboard flush task started");

    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match engine.flush_leaderboard().await {
                        Ok(0) => {}
                        Ok(flushed) => debug!(flushed, "Leaderboard rows refreshed"),
                        Err(e) => error!(error = %e, "Leaderboard flush failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Leaderboard flush task shutting down");
                    break;
                }
            }
        }
    })
}

/// Time until the next rebuild: the interval, cut short by a week boundary.
fn next_rebuild_delay(engine: &GamificationEngine, every: Duration) -> Duration {
    let now = engine.clock().now();
    let to_boundary = (next_week_start(now) - now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    // Land just after the boundary rather than on it
    every.min(to_boundary + Duration::from_millis(50))
}
