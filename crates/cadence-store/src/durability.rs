//! Periodic flush of a repository to durable storage.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::repository::JobRepository;

/// Flush `repo` every `every` until `shutdown` flips to `true`, then flush
/// one last time.
pub fn spawn_durability_task(
    repo: Arc<dyn JobRepository>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing to flush yet.
        ticker.tick().await;

        info!(interval_secs = every.as_secs(), "durability task started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = repo.flush().await {
                        error!(error = %e, "periodic flush failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = repo.flush().await {
            error!(error = %e, "final flush failed");
        }
        info!("durability task stopped");
    })
}
