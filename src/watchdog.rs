//! Watchdog - periodic recovery sweeps
//!
//! Each sweep returns stale leases to the queue, force-fails jobs that sat in
//! the queue untouched past a ceiling, and dispatches completion notifications.

use crate::db::TaskStore;
use crate::error::Result;
use crate::notify::JobNotifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stale-lease timeout as a multiple of the heartbeat interval
pub const DEFAULT_STALE_MULTIPLIER: u32 = 5;

/// Watchdog configuration
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Time between sweeps
    pub interval: Duration,

    /// Processing tasks without a heartbeat for this long are reclaimed
    pub stale_after: Duration,

    /// Queued jobs with no task activity for this long are failed
    pub queued_ceiling: Duration,

    /// Max notifications dispatched per sweep
    pub notify_batch: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(60) * DEFAULT_STALE_MULTIPLIER,
            queued_ceiling: Duration::from_secs(30 * 60),
            notify_batch: 50,
        }
    }
}

impl WatchdogConfig {
    /// Derive `stale_after` from the worker heartbeat cadence
    pub fn with_heartbeat(mut self, heartbeat_interval: Duration, multiplier: u32) -> Self {
        self.stale_after = heartbeat_interval * multiplier.max(1);
        self
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub stuck_failed: u64,
    pub notified: usize,
    pub notify_failed: usize,
}

/// Recovery service with an explicit lifecycle
pub struct Watchdog {
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn JobNotifier>,
    config: WatchdogConfig,
    shutdown: CancellationToken,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn JobNotifier>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the sweep loop in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Sweep every `interval` until stopped. Sweep errors are logged, not fatal.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting watchdog: interval {:?}, stale after {:?}, queued ceiling {:?}",
            self.config.interval, self.config.stale_after, self.config.queued_ceiling
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.sweep().await {
                error!("Watchdog sweep failed: {}", e);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.config.interval) => {}
            }
        }

        info!("Watchdog stopped");
        Ok(())
    }

    /// Run one sweep
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            reclaimed: self.store.reclaim_stale(self.config.stale_after).await?,
            ..Default::default()
        };
        if report.reclaimed > 0 {
            warn!(
                "Reclaimed {} stale task(s) with no heartbeat for {:?}",
                report.reclaimed, self.config.stale_after
            );
        }

        report.stuck_failed = self
            .store
            .fail_stuck_jobs(self.config.queued_ceiling)
            .await?;
        if report.stuck_failed > 0 {
            warn!(
                "Failed {} job(s) stuck in queue for more than {:?}",
                report.stuck_failed, self.config.queued_ceiling
            );
        }

        // notified_at is stamped by the claim, so concurrent sweeps never
        // notify the same job twice
        let jobs = self
            .store
            .claim_notifications(self.config.notify_batch)
            .await?;
        for job in jobs {
            match self.notifier.notify_complete(&job).await {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    report.notify_failed += 1;
                    warn!("Notification for job {} failed, will retry: {}", job.id, e);
                    if let Err(e) = self.store.release_notification(job.id).await {
                        error!("Could not release notification marker for job {}: {}", job.id, e);
                    }
                }
            }
        }

        debug!("Watchdog sweep: {:?}", report);
        Ok(report)
    }
}
