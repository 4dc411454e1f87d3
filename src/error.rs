//! Error types for reading-worker

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Rate limits, 5xx responses, timeouts and dropped connections.
    #[error("Transient provider error{}: {message}", fmt_status(.status))]
    ProviderTransient {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Authentication failures and malformed requests. Never retried.
    #[error("Fatal provider error{}: {message}", fmt_status(.status))]
    ProviderFatal { status: Option<u16>, message: String },

    #[error("Failed after {attempts} attempts: {target} (last error: {last_error})")]
    RetryExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Invalid task input: {0}")]
    Validation(String),

    #[error("Store operation unavailable: {0}")]
    OperationUnavailable(String),

    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Transcode error: {0}")]
    Transcode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("File system error")]
    FsError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Task timeout")]
    TaskTimeout,

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl WorkerError {
    /// Whether a provider call that raised this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::ProviderTransient { .. })
    }

    /// Whether the owning task should skip the retry budget and fail terminally.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            WorkerError::Validation(_) | WorkerError::ProviderFatal { .. }
        )
    }

    /// Provider-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            WorkerError::ProviderTransient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status returned by an external provider.
    pub fn from_provider_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        if status == 429 || status == 408 || (500..600).contains(&status) {
            WorkerError::ProviderTransient {
                status: Some(status),
                message,
                retry_after,
            }
        } else {
            WorkerError::ProviderFatal {
                status: Some(status),
                message,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
