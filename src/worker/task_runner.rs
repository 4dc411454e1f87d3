//! Task runner - main worker loop

use crate::artifacts::{content_hash, deterministic_path, ArtifactStore};
use crate::db::{
    complete_with_fallback, fail_with_fallback, ArtifactRecord, Task, TaskStatus, TaskStore,
    TaskType,
};
use crate::error::{Result, WorkerError};
use crate::worker::backoff::PollBackoff;
use crate::worker::handler::{ClaimedTask, TaskContext, TaskHandler, TaskOutcome};
use crate::worker::heartbeat::{HeartbeatGuard, HeartbeatRegistry};
use crate::worker::job_sync::sync_job_status;
use crate::worker::payload::TaskPayload;
use crate::worker::WorkerConfig;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Task runner that claims and processes tasks for one handler
pub struct TaskRunner<H> {
    store: Arc<dyn TaskStore>,
    artifacts: Arc<dyn ArtifactStore>,
    config: WorkerConfig,
    handler: Arc<H>,
    task_types: Vec<TaskType>,
    heartbeats: HeartbeatRegistry,
    backoff: Mutex<PollBackoff>,
    shutdown: CancellationToken,
}

impl<H: TaskHandler + 'static> TaskRunner<H> {
    /// Create a new task runner
    pub fn new(
        store: Arc<dyn TaskStore>,
        artifacts: Arc<dyn ArtifactStore>,
        config: WorkerConfig,
        handler: H,
    ) -> Self {
        let heartbeats = HeartbeatRegistry::new(
            Arc::clone(&store),
            config.worker_id.clone(),
            config.heartbeat_interval,
        );
        let backoff = PollBackoff::new(config.poll_interval, config.max_poll_interval);
        let task_types = handler.task_types();
        Self {
            store,
            artifacts,
            config,
            handler: Arc::new(handler),
            task_types,
            heartbeats,
            backoff: Mutex::new(backoff),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Get a handle to signal shutdown
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the loop in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Ask the loop to exit after the current iteration
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Main worker loop
    ///
    /// Claims and processes tasks until shutdown is signaled. Idle and failed
    /// claims back off exponentially; any claim that returns work resets it.
    pub async fn run(&self) -> Result<()> {
        info!("Starting worker {}...", self.config.worker_id);
        info!(
            "Task types: {:?}, concurrency: {}",
            self.task_types, self.config.max_concurrent_tasks
        );
        info!(
            "Poll interval: {:?} (max {:?}), heartbeat: {:?}, task timeout: {:?}",
            self.config.poll_interval,
            self.config.max_poll_interval,
            self.config.heartbeat_interval,
            self.config.task_timeout
        );

        let ticker_shutdown = self.shutdown.child_token();
        let ticker = self.heartbeats.spawn(ticker_shutdown.clone());

        loop {
            if self.shutdown.is_cancelled() {
                info!("Shutdown signal received, stopping worker...");
                break;
            }

            let delay = match self.claim_and_process().await {
                Ok(0) => {
                    let delay = self.next_idle_delay();
                    debug!("No pending tasks, sleeping for {:?}", delay);
                    delay
                }
                Ok(n) => {
                    debug!("Processed {} task(s), checking for more...", n);
                    continue;
                }
                Err(e) => {
                    error!("Worker error: {}", e);
                    self.next_idle_delay()
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping worker...");
                    break;
                }
                _ = sleep(delay) => {}
            }
        }

        stop_ticker(ticker_shutdown, ticker).await;
        info!("Worker stopped");
        Ok(())
    }

    /// One claim/process iteration (also used by `--once`)
    ///
    /// Leases are renewed for the duration of the call. Returns the number of
    /// tasks claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let ticker_shutdown = self.shutdown.child_token();
        let ticker = self.heartbeats.spawn(ticker_shutdown.clone());
        let result = self.claim_and_process().await;
        stop_ticker(ticker_shutdown, ticker).await;
        result
    }

    /// Claim a batch and drive every task to a state transition. Expects the
    /// heartbeat ticker to be running.
    async fn claim_and_process(&self) -> Result<usize> {
        let claimed = self
            .store
            .claim(
                &self.config.worker_id,
                self.config.max_concurrent_tasks,
                &self.task_types,
            )
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        self.reset_backoff();
        let count = claimed.len();
        info!("Claimed {} task(s)", count);

        stream::iter(claimed)
            .for_each_concurrent(self.config.max_concurrent_tasks, |task| {
                self.process_claimed(task)
            })
            .await;

        Ok(count)
    }

    /// Process one claimed task through to a state transition. Never fails;
    /// every error becomes a fail/requeue on the task.
    async fn process_claimed(&self, task: Task) {
        let task_id = task.id;
        let job_id = task.job_id;
        info!(
            "Processing task {} ({} #{}, attempt {}/{})",
            task_id,
            task.task_type,
            task.sequence,
            task.attempts + 1,
            task.max_attempts
        );

        let lease = self.heartbeats.register(task_id);
        self.sync_job(job_id).await;

        let (result, lease_lost) = match TaskPayload::parse(&task.task_type, &task.input) {
            Ok(payload) => self.execute(&task, payload, lease).await,
            Err(e) => {
                drop(lease);
                (Err(e), false)
            }
        };

        match result {
            Ok(output) => {
                if lease_lost {
                    warn!("Task {} finished after its lease was lost", task_id);
                }
                match complete_with_fallback(
                    self.store.as_ref(),
                    task_id,
                    &self.config.worker_id,
                    &output,
                )
                .await
                {
                    Ok(true) => info!("Task {} completed successfully", task_id),
                    Ok(false) => warn!(
                        "Task {} no longer owned by {}, completion discarded",
                        task_id, self.config.worker_id
                    ),
                    Err(e) => error!("Could not complete task {}: {}", task_id, e),
                }
            }
            Err(e @ WorkerError::DependencyNotReady(_)) => self.record_deferral(&task, &e).await,
            Err(e) => self.record_failure(&task, &e).await,
        }

        self.sync_job(job_id).await;
    }

    /// Run the handler under the task timeout and persist what it produced.
    /// Returns the output to store and whether the lease was lost meanwhile.
    async fn execute(
        &self,
        task: &Task,
        payload: TaskPayload,
        lease: HeartbeatGuard,
    ) -> (Result<serde_json::Value>, bool) {
        let ctx = TaskContext::new(
            self.config.worker_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
            lease,
        );
        let claimed = ClaimedTask {
            task: task.clone(),
            payload,
        };

        let handled = AssertUnwindSafe(self.handler.process(&ctx, &claimed)).catch_unwind();
        let result = match tokio::time::timeout(self.config.task_timeout, handled).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!("Handler panicked on task {}: {}", task.id, message);
                Err(WorkerError::HandlerPanic(message))
            }
            Err(_) => {
                error!(
                    "Task {} timed out after {:?}",
                    task.id, self.config.task_timeout
                );
                Err(WorkerError::TaskTimeout)
            }
        };

        let result = match result {
            Ok(outcome) => self.persist_outcome(task, outcome).await,
            Err(e) => Err(e),
        };
        (result, ctx.lease_lost())
    }

    /// Upload artifacts, enqueue follow-ups, and return the output to store
    async fn persist_outcome(&self, task: &Task, outcome: TaskOutcome) -> Result<serde_json::Value> {
        let TaskOutcome {
            mut output,
            artifacts,
            follow_ups,
        } = outcome;

        let mut stored_paths = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let path = artifact.friendly_path.clone().unwrap_or_else(|| {
                deterministic_path(task.job_id, task.id, artifact.artifact_type, &artifact.extension)
            });
            let size_bytes = artifact.bytes.len() as i64;
            let mut metadata = match artifact.metadata {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            metadata.insert(
                "sha256".to_string(),
                serde_json::Value::String(content_hash(&artifact.bytes)),
            );

            let stored = self
                .artifacts
                .put(&path, artifact.bytes, &artifact.content_type)
                .await?;
            self.store
                .record_artifact(&ArtifactRecord {
                    job_id: task.job_id,
                    task_id: task.id,
                    artifact_type: artifact.artifact_type,
                    storage_path: stored.clone(),
                    content_type: artifact.content_type,
                    size_bytes,
                    metadata: serde_json::Value::Object(metadata),
                })
                .await?;
            info!("Task {} stored {} artifact at {}", task.id, artifact.artifact_type.as_str(), stored);
            stored_paths.push(stored);
        }

        for follow_up in &follow_ups {
            match self.store.enqueue(follow_up).await? {
                Some(id) => info!(
                    "Enqueued follow-up {} ({} #{}) for job {}",
                    id,
                    follow_up.task_type.as_str(),
                    follow_up.sequence,
                    follow_up.job_id
                ),
                None => debug!(
                    "Follow-up {} #{} for job {} already exists",
                    follow_up.task_type.as_str(),
                    follow_up.sequence,
                    follow_up.job_id
                ),
            }
        }

        if let serde_json::Value::Object(map) = &mut output {
            if !stored_paths.is_empty() && !map.contains_key("artifacts") {
                map.insert("artifacts".to_string(), serde_json::json!(stored_paths));
            }
        }
        Ok(output)
    }

    async fn record_failure(&self, task: &Task, err: &WorkerError) {
        let permanent = err.is_permanent();
        let message = err.to_string();
        match fail_with_fallback(
            self.store.as_ref(),
            task.id,
            &self.config.worker_id,
            &message,
            permanent,
        )
        .await
        {
            Ok(Some(TaskStatus::Pending)) => warn!(
                "Task {} failed on attempt {}/{}, requeued: {}",
                task.id,
                task.attempts + 1,
                task.max_attempts,
                message
            ),
            Ok(Some(status)) => error!(
                "Task {} failed{} ({}): {}",
                task.id,
                if permanent { " permanently" } else { "" },
                status.as_str(),
                message
            ),
            Ok(None) => warn!(
                "Task {} no longer owned by {}, failure discarded: {}",
                task.id, self.config.worker_id, message
            ),
            Err(e) => error!("Could not record failure for task {}: {}", task.id, e),
        }
    }

    /// Hand the task back without spending an attempt
    async fn record_deferral(&self, task: &Task, err: &WorkerError) {
        let delay = self.config.dependency_retry_delay;
        match self
            .store
            .defer(task.id, &self.config.worker_id, &err.to_string(), delay)
            .await
        {
            Ok(true) => info!("Task {} deferred for {:?}: {}", task.id, delay, err),
            Ok(false) => warn!(
                "Task {} no longer owned by {}, deferral discarded",
                task.id, self.config.worker_id
            ),
            Err(e) => error!("Could not defer task {}: {}", task.id, e),
        }
    }

    async fn sync_job(&self, job_id: uuid::Uuid) {
        if let Err(e) = sync_job_status(self.store.as_ref(), job_id).await {
            warn!("Job {} status sync failed: {}", job_id, e);
        }
    }

    fn next_idle_delay(&self) -> std::time::Duration {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_idle_delay()
    }

    fn reset_backoff(&self) {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }
}

async fn stop_ticker(shutdown: CancellationToken, ticker: JoinHandle<()>) {
    shutdown.cancel();
    if let Err(e) = ticker.await {
        warn!("Heartbeat ticker ended abnormally: {}", e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Setup signal handlers for graceful shutdown
pub fn setup_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                shutdown.cancel();
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    });
}
