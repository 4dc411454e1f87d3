//! Postgres task store
//!
//! Lease operations go through the stored procedures created by
//! `migrations/0001_task_queue.sql`. If a procedure is missing the call surfaces
//! as [`WorkerError::OperationUnavailable`] so callers can fall back to
//! [`TaskStore::apply_transition`].

use crate::db::models::{
    Artifact, ArtifactRecord, Job, JobRollup, NewJob, NewTask, Task, TaskStatus, TaskSummary,
    TaskType,
};
use crate::db::store::{stuck_job_message, TaskStore, TaskTransition};
use crate::db::DbPool;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// SQLSTATE codes that mean the procedure (or its table) does not exist
const UNDEFINED_FUNCTION: &str = "42883";
const UNDEFINED_TABLE: &str = "42P01";

/// Task store backed by PostgreSQL
#[derive(Clone)]
pub struct PgTaskStore {
    pool: DbPool,
}

impl PgTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Insert a queued job (normally done by the external submitter)
    pub async fn create_job(&self, job: &NewJob) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (job_type, params, status, progress)
            VALUES ($1, $2, 'queued', '{}'::jsonb)
            RETURNING *
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.params)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }
}

/// Map a failed procedure call, flagging missing procedures
fn rpc_error(op: &str, err: sqlx::Error) -> WorkerError {
    if let sqlx::Error::Database(db_err) = &err {
        if matches!(
            db_err.code().as_deref(),
            Some(UNDEFINED_FUNCTION) | Some(UNDEFINED_TABLE)
        ) {
            return WorkerError::OperationUnavailable(op.to_string());
        }
    }
    WorkerError::DatabaseError(err)
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn claim(
        &self,
        worker_id: &str,
        max_tasks: usize,
        task_types: &[TaskType],
    ) -> Result<Vec<Task>> {
        let types: Vec<String> = task_types.iter().map(|t| t.as_str().to_string()).collect();
        let max_tasks = i32::try_from(max_tasks).unwrap_or(i32::MAX);

        sqlx::query_as::<_, Task>("SELECT * FROM claim_tasks($1, $2, $3)")
            .bind(worker_id)
            .bind(max_tasks)
            .bind(&types)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| rpc_error("claim_tasks", e))
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT heartbeat_task($1, $2)")
            .bind(task_id)
            .bind(worker_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| rpc_error("heartbeat_task", e))
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        output: &serde_json::Value,
    ) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT complete_task($1, $2, $3)")
            .bind(task_id)
            .bind(worker_id)
            .bind(output)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| rpc_error("complete_task", e))
    }

    async fn fail(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT fail_task($1, $2, $3, FALSE)")
            .bind(task_id)
            .bind(worker_id)
            .bind(error)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| rpc_error("fail_task", e))
    }

    async fn fail_permanently(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT fail_task($1, $2, $3, TRUE)")
            .bind(task_id)
            .bind(worker_id)
            .bind(error)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| rpc_error("fail_task", e))
    }

    async fn defer(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT defer_task($1, $2, $3, $4)")
            .bind(task_id)
            .bind(worker_id)
            .bind(reason)
            .bind(delay.as_secs_f64())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| rpc_error("defer_task", e))
    }

    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64> {
        let secs = i32::try_from(stale_after.as_secs()).unwrap_or(i32::MAX);
        let reclaimed = sqlx::query_scalar::<_, i32>("SELECT reclaim_stale_tasks($1)")
            .bind(secs)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| rpc_error("reclaim_stale_tasks", e))?;

        Ok(reclaimed.max(0) as u64)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM job_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    async fn apply_transition(
        &self,
        task_id: Uuid,
        worker_id: &str,
        expected_attempts: i32,
        transition: &TaskTransition,
    ) -> Result<bool> {
        let (output, attempts, error) = match transition {
            TaskTransition::Complete { output } => (Some(output), expected_attempts, None),
            TaskTransition::Requeue { attempts, error } | TaskTransition::Fail { attempts, error } => {
                (None, *attempts, Some(error.as_str()))
            }
        };

        let result = sqlx::query(
            r#"
            UPDATE job_tasks
            SET status = $4::text,
                output = COALESCE($5, output),
                attempts = $6,
                error = $7,
                worker_id = NULL,
                claimed_at = CASE WHEN $4::text = 'pending' THEN NULL ELSE claimed_at END,
                started_at = CASE WHEN $4::text = 'pending' THEN NULL ELSE started_at END,
                last_heartbeat = CASE WHEN $4::text = 'pending' THEN NULL ELSE last_heartbeat END,
                completed_at = CASE WHEN $4::text = 'pending' THEN NULL ELSE NOW() END,
                updated_at = NOW()
            WHERE id = $1
              AND worker_id = $2
              AND status = 'processing'
              AND attempts = $3
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(expected_attempts)
        .bind(transition.target_status().as_str())
        .bind(output)
        .bind(attempts)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_job_tasks(&self, job_id: Uuid) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT * FROM job_tasks WHERE job_id = $1 ORDER BY sequence ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn task_summaries(&self, job_id: Uuid) -> Result<Vec<TaskSummary>> {
        let rows = sqlx::query_as::<_, (i32, String, Option<String>)>(
            "SELECT sequence, status, error FROM job_tasks WHERE job_id = $1 ORDER BY sequence ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(sequence, status, error)| {
                Some(TaskSummary {
                    sequence,
                    status: TaskStatus::parse(&status)?,
                    error,
                })
            })
            .collect())
    }

    async fn enqueue(&self, task: &NewTask) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO job_tasks (job_id, task_type, sequence, status, input, max_attempts)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            ON CONFLICT (job_id, task_type, sequence) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(task.job_id)
        .bind(task.task_type.as_str())
        .bind(task.sequence)
        .bind(&task.input)
        .bind(task.max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn record_artifact(&self, artifact: &ArtifactRecord) -> Result<Artifact> {
        let row = sqlx::query_as::<_, Artifact>(
            r#"
            INSERT INTO job_artifacts (
                job_id, task_id, artifact_type, storage_path, content_type, size_bytes, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (task_id, artifact_type) DO UPDATE
            SET storage_path = EXCLUDED.storage_path,
                content_type = EXCLUDED.content_type,
                size_bytes = EXCLUDED.size_bytes,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(artifact.job_id)
        .bind(artifact.task_id)
        .bind(artifact.artifact_type.as_str())
        .bind(&artifact.storage_path)
        .bind(&artifact.content_type)
        .bind(artifact.size_bytes)
        .bind(&artifact.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn apply_job_rollup(&self, job_id: Uuid, rollup: &JobRollup) -> Result<bool> {
        let progress = serde_json::to_value(&rollup.progress)?;

        // Terminal jobs may be rewritten with another terminal roll-up, never
        // moved back to processing.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2::text,
                progress = $3,
                error = $4,
                completed_at = CASE
                    WHEN $2::text IN ('complete', 'error') THEN COALESCE(completed_at, NOW())
                    ELSE completed_at
                END,
                updated_at = NOW()
            WHERE id = $1
              AND NOT (status IN ('complete', 'error') AND $2::text NOT IN ('complete', 'error'))
            "#,
        )
        .bind(job_id)
        .bind(rollup.status.as_str())
        .bind(&progress)
        .bind(&rollup.error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_stuck_jobs(&self, queued_for: Duration) -> Result<u64> {
        let failed = sqlx::query_scalar::<_, i64>(
            r#"
            WITH stuck AS (
                UPDATE jobs j
                SET status = 'error',
                    error = $2,
                    completed_at = NOW(),
                    updated_at = NOW()
                WHERE j.status = 'queued'
                  AND j.created_at < NOW() - make_interval(secs => $1)
                  AND NOT EXISTS (
                      SELECT 1 FROM job_tasks t
                      WHERE t.job_id = j.id
                        AND (t.status <> 'pending' OR t.claimed_at IS NOT NULL)
                  )
                RETURNING j.id
            ),
            abandoned AS (
                UPDATE job_tasks t
                SET status = 'failed',
                    error = $2,
                    completed_at = NOW(),
                    updated_at = NOW()
                FROM stuck
                WHERE t.job_id = stuck.id
                  AND t.status = 'pending'
                RETURNING t.id
            )
            SELECT COUNT(*) FROM stuck
            "#,
        )
        .bind(queued_for.as_secs_f64())
        .bind(stuck_job_message(queued_for))
        .fetch_one(&self.pool)
        .await?;

        Ok(failed.max(0) as u64)
    }

    async fn claim_notifications(&self, limit: usize) -> Result<Vec<Job>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET notified_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'complete'
                  AND notified_at IS NULL
                ORDER BY completed_at ASC NULLS LAST
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn release_notification(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET notified_at = NULL WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn count_tasks_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM job_tasks GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
