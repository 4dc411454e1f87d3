//! In-process task store
//!
//! Mirrors the stored-procedure semantics of the Postgres store behind a single
//! mutex. Used by the test suite and by `worker --memory` dev runs.

use crate::clock::{Clock, SystemClock};
use crate::db::models::{
    Artifact, ArtifactRecord, Job, JobRollup, JobStatus, NewJob, NewTask, Task, TaskStatus,
    TaskSummary, TaskType,
};
use crate::db::store::{next_failure_state, stuck_job_message, TaskStore, TaskTransition};
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct State {
    jobs: Vec<Job>,
    tasks: Vec<Task>,
    artifacts: Vec<Artifact>,
    unavailable: HashSet<String>,
}

impl State {
    fn task_mut(&mut self, task_id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    fn job_mut(&mut self, job_id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    fn check_available(&self, op: &str) -> Result<()> {
        if self.unavailable.contains(op) {
            return Err(WorkerError::OperationUnavailable(op.to_string()));
        }
        Ok(())
    }
}

/// Task store held entirely in memory
pub struct MemoryTaskStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert a queued job (stands in for the external submitter)
    pub fn insert_job(&self, job: NewJob) -> Job {
        let now = self.now();
        let job = Job {
            id: Uuid::new_v4(),
            job_type: job.job_type,
            params: job.params,
            status: JobStatus::Queued.as_str().to_string(),
            progress: serde_json::json!({}),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            notified_at: None,
        };
        self.state().jobs.push(job.clone());
        job
    }

    /// Simulate a missing stored procedure (`complete_task`, `fail_task`)
    pub fn set_unavailable(&self, op: &str, unavailable: bool) {
        let mut state = self.state();
        if unavailable {
            state.unavailable.insert(op.to_string());
        } else {
            state.unavailable.remove(op);
        }
    }

    /// Snapshot of every stored artifact row
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.state().artifacts.clone()
    }

    /// Snapshot of every task
    pub fn tasks(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    fn record_failure(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        permanent: bool,
    ) -> Result<bool> {
        let now = self.now();
        let mut state = self.state();
        state.check_available("fail_task")?;

        let Some(task) = state.task_mut(task_id) else {
            return Ok(false);
        };
        if !task.is_owned_by(worker_id) {
            return Ok(false);
        }

        let (status, attempts) = if permanent {
            (TaskStatus::Failed, task.max_attempts)
        } else {
            next_failure_state(task.attempts, task.max_attempts)
        };
        task.attempts = attempts;
        task.error = Some(error.to_string());
        task.updated_at = now;
        set_status(task, status, now);
        Ok(true)
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn clear_claim(task: &mut Task) {
    task.worker_id = None;
    task.claimed_at = None;
    task.started_at = None;
    task.last_heartbeat = None;
}

fn set_status(task: &mut Task, status: TaskStatus, now: DateTime<Utc>) {
    task.status = status.as_str().to_string();
    match status {
        TaskStatus::Pending => clear_claim(task),
        TaskStatus::Complete | TaskStatus::Failed => {
            task.worker_id = None;
            task.completed_at = Some(now);
        }
        TaskStatus::Processing => {}
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn claim(
        &self,
        worker_id: &str,
        max_tasks: usize,
        task_types: &[TaskType],
    ) -> Result<Vec<Task>> {
        let now = self.now();
        let mut state = self.state();
        let types: Vec<&str> = task_types.iter().map(|t| t.as_str()).collect();

        let mut candidates: Vec<usize> = state
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.status == TaskStatus::Pending.as_str()
                    && types.contains(&t.task_type.as_str())
                    && t.available_at.map_or(true, |at| at <= now)
            })
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| (state.tasks[i].created_at, state.tasks[i].sequence));
        candidates.truncate(max_tasks);

        let mut claimed = Vec::with_capacity(candidates.len());
        for i in candidates {
            let task = &mut state.tasks[i];
            task.status = TaskStatus::Processing.as_str().to_string();
            task.worker_id = Some(worker_id.to_string());
            task.claimed_at = Some(now);
            task.started_at = Some(now);
            task.last_heartbeat = Some(now);
            task.available_at = None;
            task.updated_at = now;
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        let now = self.now();
        let mut state = self.state();
        match state.task_mut(task_id) {
            Some(task) if task.is_owned_by(worker_id) => {
                task.last_heartbeat = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        output: &serde_json::Value,
    ) -> Result<bool> {
        let now = self.now();
        let mut state = self.state();
        state.check_available("complete_task")?;
        match state.task_mut(task_id) {
            Some(task) if task.is_owned_by(worker_id) => {
                task.output = Some(output.clone());
                task.error = None;
                task.updated_at = now;
                set_status(task, TaskStatus::Complete, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        self.record_failure(task_id, worker_id, error, false)
    }

    async fn fail_permanently(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        self.record_failure(task_id, worker_id, error, true)
    }

    async fn defer(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<bool> {
        let now = self.now();
        let mut state = self.state();
        match state.task_mut(task_id) {
            Some(task) if task.is_owned_by(worker_id) => {
                task.error = Some(reason.to_string());
                task.updated_at = now;
                set_status(task, TaskStatus::Pending, now);
                task.available_at = Some(cutoff_after(now, delay));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64> {
        let now = self.now();
        let cutoff = cutoff_before(now, stale_after);
        let mut state = self.state();
        let mut reclaimed = 0;
        for task in state.tasks.iter_mut() {
            if task.status != TaskStatus::Processing.as_str() {
                continue;
            }
            let last_seen = task.last_heartbeat.or(task.claimed_at);
            if last_seen.map_or(true, |seen| seen < cutoff) {
                task.status = TaskStatus::Pending.as_str().to_string();
                clear_claim(task);
                task.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.state().tasks.iter().find(|t| t.id == task_id).cloned())
    }

    async fn apply_transition(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_attempts: i32,
        transition: &TaskTransition,
    ) -> Result<bool> {
        let now = self.now();
        let mut state = self.state();
        let Some(task) = state.task_mut(task_id) else {
            return Ok(false);
        };
        if !task.is_owned_by(worker_id) || task.attempts != expected_attempts {
            return Ok(false);
        }
        match transition {
            TaskTransition::Complete { output } => {
                task.output = Some(output.clone());
                task.error = None;
            }
            TaskTransition::Requeue { attempts, error } | TaskTransition::Fail { attempts, error } => {
                task.attempts = *attempts;
                task.error = Some(error.clone());
            }
        }
        task.updated_at = now;
        set_status(task, transition.target_status(), now);
        Ok(true)
    }

    async fn list_job_tasks(&self, job_id: Uuid) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .state()
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks)
    }

    async fn task_summaries(&self, job_id: Uuid) -> Result<Vec<TaskSummary>> {
        Ok(self
            .list_job_tasks(job_id)
            .await?
            .into_iter()
            .filter_map(|t| {
                Some(TaskSummary {
                    sequence: t.sequence,
                    status: t.status()?,
                    error: t.error,
                })
            })
            .collect())
    }

    async fn enqueue(&self, new_task: &NewTask) -> Result<Option<Uuid>> {
        let now = self.now();
        let mut state = self.state();
        let task_type = new_task.task_type.as_str();
        let exists = state.tasks.iter().any(|t| {
            t.job_id == new_task.job_id && t.task_type == task_type && t.sequence == new_task.sequence
        });
        if exists {
            return Ok(None);
        }

        let id = Uuid::new_v4();
        state.tasks.push(Task {
            id,
            job_id: new_task.job_id,
            task_type: task_type.to_string(),
            sequence: new_task.sequence,
            status: TaskStatus::Pending.as_str().to_string(),
            input: new_task.input.clone(),
            output: None,
            attempts: 0,
            max_attempts: new_task.max_attempts,
            worker_id: None,
            claimed_at: None,
            started_at: None,
            last_heartbeat: None,
            available_at: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        });
        Ok(Some(id))
    }

    async fn record_artifact(&self, record: &ArtifactRecord) -> Result<Artifact> {
        let now = self.now();
        let mut state = self.state();
        let artifact_type = record.artifact_type.as_str();

        if let Some(existing) = state
            .artifacts
            .iter_mut()
            .find(|a| a.task_id == record.task_id && a.artifact_type == artifact_type)
        {
            existing.storage_path = record.storage_path.clone();
            existing.content_type = record.content_type.clone();
            existing.size_bytes = record.size_bytes;
            existing.metadata = record.metadata.clone();
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let artifact = Artifact {
            id: Uuid::new_v4(),
            job_id: record.job_id,
            task_id: record.task_id,
            artifact_type: artifact_type.to_string(),
            storage_path: record.storage_path.clone(),
            content_type: record.content_type.clone(),
            size_bytes: record.size_bytes,
            metadata: record.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        state.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.state().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn apply_job_rollup(&self, job_id: Uuid, rollup: &JobRollup) -> Result<bool> {
        let now = self.now();
        let mut state = self.state();
        let Some(job) = state.job_mut(job_id) else {
            return Ok(false);
        };
        let current = job.status();
        if current.is_some_and(|s| s.is_terminal()) && !rollup.status.is_terminal() {
            return Ok(false);
        }

        job.status = rollup.status.as_str().to_string();
        job.progress = serde_json::to_value(&rollup.progress)?;
        job.error = rollup.error.clone();
        job.updated_at = now;
        if rollup.status.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn fail_stuck_jobs(&self, queued_for: Duration) -> Result<u64> {
        let now = self.now();
        let cutoff = cutoff_before(now, queued_for);
        let message = stuck_job_message(queued_for);
        let mut state = self.state();

        let active: HashSet<Uuid> = state
            .tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Pending.as_str() || t.claimed_at.is_some())
            .map(|t| t.job_id)
            .collect();

        let mut stuck = HashSet::new();
        for job in state.jobs.iter_mut() {
            if job.status == JobStatus::Queued.as_str()
                && job.created_at < cutoff
                && !active.contains(&job.id)
            {
                job.status = JobStatus::Error.as_str().to_string();
                job.error = Some(message.clone());
                job.updated_at = now;
                job.completed_at = Some(now);
                stuck.insert(job.id);
            }
        }

        for task in state.tasks.iter_mut() {
            if stuck.contains(&task.job_id) && task.status == TaskStatus::Pending.as_str() {
                task.error = Some(message.clone());
                task.updated_at = now;
                set_status(task, TaskStatus::Failed, now);
            }
        }
        Ok(stuck.len() as u64)
    }

    async fn claim_notifications(&self, limit: usize) -> Result<Vec<Job>> {
        let now = self.now();
        let mut state = self.state();
        let mut claimed = Vec::new();
        for job in state.jobs.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if job.status == JobStatus::Complete.as_str() && job.notified_at.is_none() {
                job.notified_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_notification(&self, job_id: Uuid) -> Result<()> {
        if let Some(job) = self.state().job_mut(job_id) {
            job.notified_at = None;
        }
        Ok(())
    }

    async fn count_tasks_by_status(&self) -> Result<Vec<(String, i64)>> {
        let state = self.state();
        let mut counts: Vec<(String, i64)> = Vec::new();
        for task in &state.tasks {
            match counts.iter_mut().find(|(s, _)| *s == task.status) {
                Some((_, n)) => *n += 1,
                None => counts.push((task.status.clone(), 1)),
            }
        }
        counts.sort();
        Ok(counts)
    }
}

fn cutoff_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
