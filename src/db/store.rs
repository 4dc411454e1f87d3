//! Durable task store contract
//!
//! Every lease-changing operation is conditional on the caller still owning the
//! task (`worker_id` matches and `status = processing`). A caller that lost its
//! lease gets `Ok(false)` back, never an error and never a silent overwrite.

use crate::db::models::{
    Artifact, ArtifactRecord, Job, JobRollup, NewTask, Task, TaskStatus, TaskSummary, TaskType,
};
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically move up to `max_tasks` pending tasks of the given types to
    /// processing, stamping `worker_id`, `claimed_at`, `started_at` and `last_heartbeat`.
    async fn claim(
        &self,
        worker_id: &str,
        max_tasks: usize,
        task_types: &[TaskType],
    ) -> Result<Vec<Task>>;

    /// Renew the lease. Returns false when the caller no longer owns the task.
    async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Mark the task complete with its output.
    async fn complete(&self, task_id: Uuid, worker_id: &str, output: &serde_json::Value)
        -> Result<bool>;

    /// Record a failure; requeues or fails terminally per [`next_failure_state`].
    async fn fail(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<bool>;

    /// Record a failure that must not be retried (invalid input).
    async fn fail_permanently(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<bool>;

    /// Requeue without spending an attempt, claimable again after `delay`.
    /// Used when the task is waiting on another task rather than failing.
    async fn defer(&self, task_id: Uuid, worker_id: &str, reason: &str, delay: Duration)
        -> Result<bool>;

    /// Reset processing tasks whose last heartbeat is older than `stale_after`.
    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Conditional write used when the atomic complete/fail primitive is
    /// unavailable. Applies only if the caller still owns the task and `attempts`
    /// still equals `expected_attempts`.
    async fn apply_transition(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_attempts: i32,
        transition: &TaskTransition,
    ) -> Result<bool>;

    /// All tasks of a job ordered by sequence
    async fn list_job_tasks(&self, job_id: Uuid) -> Result<Vec<Task>>;

    async fn task_summaries(&self, job_id: Uuid) -> Result<Vec<TaskSummary>>;

    /// Insert a pending task. Returns None when `(job_id, task_type, sequence)`
    /// already exists, so replays of the same follow-up are harmless.
    async fn enqueue(&self, task: &NewTask) -> Result<Option<Uuid>>;

    /// Upsert on `(task_id, artifact_type)`
    async fn record_artifact(&self, artifact: &ArtifactRecord) -> Result<Artifact>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Persist a roll-up. Never moves a terminal job back to processing.
    async fn apply_job_rollup(&self, job_id: Uuid, rollup: &JobRollup) -> Result<bool>;

    /// Force-fail jobs queued longer than `queued_for` whose tasks were never
    /// claimed. Their pending tasks are failed with the job so nothing can
    /// complete a job that was already reported as an error.
    async fn fail_stuck_jobs(&self, queued_for: Duration) -> Result<u64>;

    /// Stamp `notified_at` on up to `limit` complete, un-notified jobs and return them.
    async fn claim_notifications(&self, limit: usize) -> Result<Vec<Job>>;

    /// Clear `notified_at` so a later sweep retries the notification.
    async fn release_notification(&self, job_id: Uuid) -> Result<()>;

    /// Task counts grouped by status, for monitoring
    async fn count_tasks_by_status(&self) -> Result<Vec<(String, i64)>>;
}

/// State change applied through [`TaskStore::apply_transition`]
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Complete { output: serde_json::Value },
    Requeue { attempts: i32, error: String },
    Fail { attempts: i32, error: String },
}

impl TaskTransition {
    pub fn target_status(&self) -> TaskStatus {
        match self {
            TaskTransition::Complete { .. } => TaskStatus::Complete,
            TaskTransition::Requeue { .. } => TaskStatus::Pending,
            TaskTransition::Fail { .. } => TaskStatus::Failed,
        }
    }
}

/// Status and attempt count after one more failure.
///
/// The retry budget is checked against the attempts recorded before this
/// failure; the stored count never exceeds `max_attempts`.
pub fn next_failure_state(attempts: i32, max_attempts: i32) -> (TaskStatus, i32) {
    let next = (attempts + 1).min(max_attempts);
    if attempts < max_attempts {
        (TaskStatus::Pending, next)
    } else {
        (TaskStatus::Failed, next)
    }
}

/// Transition for a failure on `task`
pub fn failure_transition(task: &Task, error: &str, permanent: bool) -> TaskTransition {
    if permanent {
        return TaskTransition::Fail {
            attempts: task.max_attempts,
            error: error.to_string(),
        };
    }
    match next_failure_state(task.attempts, task.max_attempts) {
        (TaskStatus::Pending, attempts) => TaskTransition::Requeue {
            attempts,
            error: error.to_string(),
        },
        (_, attempts) => TaskTransition::Fail {
            attempts,
            error: error.to_string(),
        },
    }
}

/// Error message stored on jobs failed by the stuck-job sweep
pub fn stuck_job_message(queued_for: Duration) -> String {
    format!(
        "Job stuck in queue for more than {} minutes with no task activity",
        queued_for.as_secs() / 60
    )
}

/// Fail a task, falling back to read-modify-write when the atomic primitive is
/// missing. Returns the status the task was moved to, or None on a lost lease.
pub async fn fail_with_fallback(
    store: &dyn TaskStore,
    task_id: Uuid,
    worker_id: &str,
    error: &str,
    permanent: bool,
) -> Result<Option<TaskStatus>> {
    let primary = if permanent {
        store.fail_permanently(task_id, worker_id, error).await
    } else {
        store.fail(task_id, worker_id, error).await
    };

    match primary {
        Ok(true) => Ok(store
            .get_task(task_id)
            .await?
            .and_then(|t| t.status())),
        Ok(false) => Ok(None),
        Err(WorkerError::OperationUnavailable(op)) => {
            warn!(
                "Atomic {} unavailable for task {}, using conditional update",
                op, task_id
            );
            let Some(task) = store.get_task(task_id).await? else {
                return Ok(None);
            };
            if !task.is_owned_by(worker_id) {
                return Ok(None);
            }
            let transition = failure_transition(&task, error, permanent);
            let applied = store
                .apply_transition(task_id, worker_id, task.attempts, &transition)
                .await?;
            Ok(applied.then(|| transition.target_status()))
        }
        Err(e) => Err(e),
    }
}

/// Complete a task, falling back to a conditional update when the atomic
/// primitive is missing.
pub async fn complete_with_fallback(
    store: &dyn TaskStore,
    task_id: Uuid,
    worker_id: &str,
    output: &serde_json::Value,
) -> Result<bool> {
    match store.complete(task_id, worker_id, output).await {
        Err(WorkerError::OperationUnavailable(op)) => {
            warn!(
                "Atomic {} unavailable for task {}, using conditional update",
                op, task_id
            );
            let Some(task) = store.get_task(task_id).await? else {
                return Ok(false);
            };
            if !task.is_owned_by(worker_id) {
                return Ok(false);
            }
            store
                .apply_transition(
                    task_id,
                    worker_id,
                    task.attempts,
                    &TaskTransition::Complete {
                        output: output.clone(),
                    },
                )
                .await
        }
        other => other,
    }
}
