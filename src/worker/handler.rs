//! Contract between the worker loop and task-type specific processing

use crate::artifacts::ArtifactStore;
use crate::db::{ArtifactType, NewTask, Task, TaskStore};
use crate::error::Result;
use crate::worker::heartbeat::HeartbeatGuard;
use crate::worker::payload::TaskPayload;
use async_trait::async_trait;
use std::sync::Arc;

/// Processes claimed tasks of one or more types
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task types this handler accepts; the worker claims only these
    fn task_types(&self) -> Vec<crate::db::TaskType>;

    /// Run the task. Errors become state transitions in the worker loop.
    async fn process(&self, ctx: &TaskContext, task: &ClaimedTask) -> Result<TaskOutcome>;
}

/// Everything a handler may touch while processing one task
pub struct TaskContext {
    pub worker_id: String,
    pub store: Arc<dyn TaskStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    lease: HeartbeatGuard,
}

impl TaskContext {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        artifacts: Arc<dyn ArtifactStore>,
        lease: HeartbeatGuard,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            artifacts,
            lease,
        }
    }

    /// True once a heartbeat reported the lease gone. Handlers may stop early;
    /// the final complete/fail is a no-op either way.
    pub fn lease_lost(&self) -> bool {
        self.lease.is_lost()
    }
}

/// A claimed task with its validated input
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub payload: TaskPayload,
}

/// Artifact produced by a handler, uploaded by the worker before completion
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub artifact_type: ArtifactType,
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// File extension without the dot
    pub extension: String,
    pub metadata: serde_json::Value,
    /// User-facing path for final deliverables; the deterministic task path is used otherwise
    pub friendly_path: Option<String>,
}

/// Successful result of [`TaskHandler::process`]
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub output: serde_json::Value,
    pub artifacts: Vec<NewArtifact>,
    /// Downstream stages, enqueued as task rows before completion
    pub follow_ups: Vec<NewTask>,
}

impl TaskOutcome {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact: NewArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_follow_up(mut self, task: NewTask) -> Self {
        self.follow_ups.push(task);
        self
    }
}
