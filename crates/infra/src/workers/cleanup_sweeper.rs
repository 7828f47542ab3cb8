use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::CleanupConfig;
use crate::tenant_store::{StoreError, TenantStore};

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepStats {
    pub runs: u64,
    pub dropped_total: u64,
    pub failures: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweepStats>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for an in-flight sweep to finish.
    ///
    /// Returns the join error if the sweep loop panicked or was cancelled.
    pub async fn shutdown(mut self) -> Result<(), JoinError> {
        let _ = self.shutdown.send(true);
        match self.join.take() {
            Some(j) => j.await.inspect_err(|e| {
                error!(error = %e, "cleanup sweeper task did not stop cleanly");
            }),
            None => Ok(()),
        }
    }

    /// Get current sweeper statistics.
    pub fn stats(&self) -> SweepStats {
        lock_stats(&self.stats).clone()
    }
}

/// Periodically drops tenant namespaces idle for longer than the configured
/// age threshold.
///
/// The first sweep runs immediately; later sweeps run every
/// `config.interval`. Ticks missed while a sweep is slow are skipped rather
/// than bunched up. A failed sweep is logged and counted, and the loop keeps
/// going.
#[derive(Debug)]
pub struct CleanupSweeper;

impl CleanupSweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn spawn<S>(store: S, config: CleanupConfig) -> SweeperHandle
    where
        S: TenantStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweepStats::default()));
        let stats_clone = Arc::clone(&stats);

        let join = tokio::spawn(sweeper_loop(store, config, shutdown_rx, stats_clone));

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Run a single sweep and return how many namespaces were dropped.
    pub async fn sweep_once<S>(store: &S, age_threshold: Duration) -> Result<u64, StoreError>
    where
        S: TenantStore + ?Sized,
    {
        let dropped = store.cleanup_stale_tenants(age_threshold).await?;
        if dropped > 0 {
            info!(dropped, "stale tenant sweep complete");
        } else {
            debug!("stale tenant sweep found nothing to drop");
        }
        Ok(dropped)
    }
}

async fn sweeper_loop<S: TenantStore>(
    store: S,
    config: CleanupConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<SweepStats>>,
) {
    info!(
        age_secs = config.age_threshold.as_secs(),
        interval_secs = config.interval.as_secs(),
        "cleanup sweeper started"
    );
    let start_time = Instant::now();

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped handle also stops the loop.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let result = CleanupSweeper::sweep_once(&store, config.age_threshold).await;

                let mut s = lock_stats(&stats);
                s.runs += 1;
                s.uptime_secs = start_time.elapsed().as_secs();
                match result {
                    Ok(dropped) => s.dropped_total += dropped,
                    Err(e) => {
                        s.failures += 1;
                        error!(error = %e, "stale tenant sweep failed");
                    }
                }
            }
        }
    }

    info!("cleanup sweeper stopped");
}

fn lock_stats(stats: &Mutex<SweepStats>) -> std::sync::MutexGuard<'_, SweepStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
