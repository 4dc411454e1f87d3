//! Lease renewal for claimed tasks
//!
//! One ticker per worker renews every registered lease. Registration returns a
//! [`HeartbeatGuard`]; dropping the guard deregisters the task, so every exit
//! path of the processing code stops the renewals.

use crate::db::TaskStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

type LeaseMap = Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>;

/// Registry of leases held by one worker
#[derive(Clone)]
pub struct HeartbeatRegistry {
    store: Arc<dyn TaskStore>,
    worker_id: String,
    interval: Duration,
    leases: LeaseMap,
}

impl HeartbeatRegistry {
    pub fn new(store: Arc<dyn TaskStore>, worker_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            interval,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start renewing `task_id` until the returned guard is dropped
    pub fn register(&self, task_id: Uuid) -> HeartbeatGuard {
        let lost = Arc::new(AtomicBool::new(false));
        lock(&self.leases).insert(task_id, Arc::clone(&lost));
        HeartbeatGuard {
            task_id,
            leases: Arc::clone(&self.leases),
            lost,
        }
    }

    /// Number of leases currently registered
    pub fn active(&self) -> usize {
        lock(&self.leases).len()
    }

    /// Renew every registered lease once. Returns how many renewals succeeded.
    pub async fn beat_all(&self) -> usize {
        let snapshot: Vec<(Uuid, Arc<AtomicBool>)> = lock(&self.leases)
            .iter()
            .filter(|(_, lost)| !lost.load(Ordering::Relaxed))
            .map(|(id, lost)| (*id, Arc::clone(lost)))
            .collect();

        let mut renewed = 0;
        for (task_id, lost) in snapshot {
            match self.store.heartbeat(task_id, &self.worker_id).await {
                Ok(true) => {
                    renewed += 1;
                    debug!("Heartbeat renewed for task {}", task_id);
                }
                Ok(false) => {
                    // Reclaimed by the watchdog or finished elsewhere
                    lost.store(true, Ordering::Relaxed);
                    warn!(
                        "Lost lease on task {} (worker {}), stopping heartbeats",
                        task_id, self.worker_id
                    );
                }
                Err(e) => {
                    warn!("Heartbeat for task {} failed: {}", task_id, e);
                }
            }
        }
        renewed
    }

    /// Spawn the ticker. It stops when `shutdown` is cancelled.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            // Claiming stamps last_heartbeat, so the first renewal is one interval out
            let mut ticker = interval_at(Instant::now() + registry.interval, registry.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.beat_all().await;
                    }
                }
            }
            debug!("Heartbeat ticker for {} stopped", registry.worker_id);
        })
    }
}

/// Keeps a lease registered while alive
pub struct HeartbeatGuard {
    task_id: Uuid,
    leases: LeaseMap,
    lost: Arc<AtomicBool>,
}

impl HeartbeatGuard {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// True once a renewal reported that this worker no longer owns the task
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Relaxed)
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        lock(&self.leases).remove(&self.task_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
