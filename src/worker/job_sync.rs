//! Job status derived from task statuses
//!
//! Recomputed after every task transition instead of relying on a database
//! trigger, so a job always reflects the current state of its tasks.

use crate::db::{JobProgress, JobRollup, JobStatus, TaskStatus, TaskStore, TaskSummary};
use crate::error::Result;
use tracing::debug;
use uuid::Uuid;

/// Roll task summaries up into a job status. Returns None for a job without tasks.
pub fn compute_job_rollup(tasks: &[TaskSummary]) -> Option<JobRollup> {
    if tasks.is_empty() {
        return None;
    }

    let total = tasks.len() as u32;
    let complete = count(tasks, TaskStatus::Complete);
    let failed = count(tasks, TaskStatus::Failed);
    let done = complete + failed;

    let (status, percent, error) = if done == total && failed > 0 {
        let first_failure = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .min_by_key(|t| t.sequence)
            .and_then(|t| t.error.clone())
            .or_else(|| Some("Task failed".to_string()));
        (JobStatus::Error, rounded_percent(complete, total), first_failure)
    } else if done == total {
        (JobStatus::Complete, 100, None)
    } else {
        (JobStatus::Processing, rounded_percent(complete, total), None)
    };

    Some(JobRollup {
        status,
        progress: JobProgress {
            percent,
            phase: status.as_str().to_string(),
            tasks_total: total,
            tasks_complete: complete,
            tasks_failed: failed,
        },
        error,
    })
}

/// Recompute and persist the roll-up for `job_id`
pub async fn sync_job_status(store: &dyn TaskStore, job_id: Uuid) -> Result<Option<JobRollup>> {
    let summaries = store.task_summaries(job_id).await?;
    let Some(rollup) = compute_job_rollup(&summaries) else {
        debug!("Job {} has no tasks, leaving status untouched", job_id);
        return Ok(None);
    };

    let applied = store.apply_job_rollup(job_id, &rollup).await?;
    debug!(
        "Job {} -> {} ({}%){}",
        job_id,
        rollup.status.as_str(),
        rollup.progress.percent,
        if applied { "" } else { " [terminal, not applied]" }
    );
    Ok(Some(rollup))
}

fn count(tasks: &[TaskSummary], status: TaskStatus) -> u32 {
    tasks.iter().filter(|t| t.status == status).count() as u32
}

/// round(100 * part / total), halves rounded up
fn rounded_percent(part: u32, total: u32) -> u8 {
    let percent = (200 * u64::from(part) + u64::from(total)) / (2 * u64::from(total));
    percent.min(100) as u8
}
