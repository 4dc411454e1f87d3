//! Worker module for claiming and processing queued tasks
//!
//! This module provides:
//! - TaskRunner: Main worker loop that claims, heartbeats and settles tasks
//! - TaskHandler: Contract implemented by task-type specific processors
//! - HeartbeatRegistry: Lease renewal for in-flight tasks
//! - job_sync: Job status roll-up from task statuses
//! - WorkerConfig: Configuration for the worker

pub mod backoff;
pub mod config;
pub mod handler;
pub mod heartbeat;
pub mod job_sync;
pub mod payload;
pub mod task_runner;

pub use backoff::{exponential_delay, PollBackoff};
pub use config::WorkerConfig;
pub use handler::{ClaimedTask, NewArtifact, TaskContext, TaskHandler, TaskOutcome};
pub use heartbeat::{HeartbeatGuard, HeartbeatRegistry};
pub use job_sync::{compute_job_rollup, sync_job_status};
pub use payload::{
    AudioGenerationInput, DeliverableLabel, PdfGenerationInput, TaskPayload, TextGenerationInput,
    TextSource,
};
pub use task_runner::{setup_signal_handler, TaskRunner};
