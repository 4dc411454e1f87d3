//! Database models matching the task-queue schema in `migrations/`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Jobs
// ============================================================================

/// Job - Matches jobs table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub params: serde_json::Value,
    pub status: String,
    pub progress: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Progress decoded from the JSON column (defaults when absent or malformed)
    pub fn progress(&self) -> JobProgress {
        serde_json::from_value(self.progress.clone()).unwrap_or_default()
    }
}

/// NewJob - For inserting new jobs (normally done by the external submitter)
#[derive(Debug, Clone, Serialize)]
pub struct NewJob {
    pub job_type: String,
    pub params: serde_json::Value,
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "complete" => Some(JobStatus::Complete),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }
}

/// Structured job progress stored in `jobs.progress`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub phase: String,
    pub tasks_total: u32,
    pub tasks_complete: u32,
    pub tasks_failed: u32,
}

/// Job status and progress derived from the statuses of its tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRollup {
    pub status: JobStatus,
    pub progress: JobProgress,
    pub error: Option<String>,
}

// ============================================================================
// Tasks
// ============================================================================

/// Task - Matches job_tasks table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub task_type: String,
    pub sequence: i32,
    pub status: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Not claimable before this instant (set when a task is deferred)
    pub available_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    /// True when `worker_id` currently holds the lease
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == TaskStatus::Processing.as_str()
            && self.worker_id.as_deref() == Some(worker_id)
    }
}

/// NewTask - For enqueueing tasks (fan-out or handler follow-ups)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub job_id: Uuid,
    pub task_type: TaskType,
    pub sequence: i32,
    pub input: serde_json::Value,
    pub max_attempts: i32,
}

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "complete" => Some(TaskStatus::Complete),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

/// Task type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextGeneration,
    AudioGeneration,
    PdfGeneration,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TextGeneration => "text_generation",
            TaskType::AudioGeneration => "audio_generation",
            TaskType::PdfGeneration => "pdf_generation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text_generation" => Some(TaskType::TextGeneration),
            "audio_generation" => Some(TaskType::AudioGeneration),
            "pdf_generation" => Some(TaskType::PdfGeneration),
            _ => None,
        }
    }
}

/// Minimal view of a task used for job roll-ups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub sequence: i32,
    pub status: TaskStatus,
    pub error: Option<String>,
}

// ============================================================================
// Artifacts
// ============================================================================

/// Artifact type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Text,
    Audio,
    Pdf,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Text => "text",
            ArtifactType::Audio => "audio",
            ArtifactType::Pdf => "pdf",
        }
    }
}

/// Artifact - Matches job_artifacts table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub artifact_type: String,
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// ArtifactRecord - For upserting artifact rows after the bytes are stored
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub artifact_type: ArtifactType,
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub metadata: serde_json::Value,
}
