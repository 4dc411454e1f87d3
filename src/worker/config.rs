//! Worker configuration

use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease owner id written to claimed rows
    pub worker_id: String,

    /// Upper bound on tasks claimed and processed per iteration
    pub max_concurrent_tasks: usize,

    /// Poll interval after the first empty claim
    pub poll_interval: Duration,

    /// Ceiling for the doubling idle backoff
    pub max_poll_interval: Duration,

    /// Lease renewal cadence
    pub heartbeat_interval: Duration,

    /// Task timeout
    pub task_timeout: Duration,

    /// How long a task waiting on an unfinished dependency stays unclaimable
    pub dependency_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            max_concurrent_tasks: 2,
            poll_interval: Duration::from_secs(5),
            max_poll_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            task_timeout: Duration::from_secs(30 * 60),
            dependency_retry_delay: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a new config builder
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }
}

/// `{hostname}-{pid}-{short uuid}`, unique per process
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

/// Builder for WorkerConfig
#[derive(Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Set the lease owner id
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    /// Set max tasks per iteration (at least 1)
    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.config.max_concurrent_tasks = n.max(1);
        self
    }

    /// Set poll interval
    pub fn poll_interval(mut self, duration: Duration) -> Self {
        self.config.poll_interval = duration;
        self
    }

    /// Set poll interval in seconds
    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.poll_interval = Duration::from_secs(secs);
        self
    }

    /// Set idle backoff ceiling
    pub fn max_poll_interval(mut self, duration: Duration) -> Self {
        self.config.max_poll_interval = duration;
        self
    }

    /// Set heartbeat interval
    pub fn heartbeat_interval(mut self, duration: Duration) -> Self {
        self.config.heartbeat_interval = duration;
        self
    }

    /// Set task timeout
    pub fn task_timeout(mut self, duration: Duration) -> Self {
        self.config.task_timeout = duration;
        self
    }

    /// Set the deferral applied to tasks whose dependencies are not ready
    pub fn dependency_retry_delay(mut self, duration: Duration) -> Self {
        self.config.dependency_retry_delay = duration;
        self
    }

    /// Build the config
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_poll_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.task_timeout, Duration::from_secs(1800));
        assert_eq!(config.dependency_retry_delay, Duration::from_secs(30));
    }

    #[test]
    fn builder_clamps_concurrency() {
        let config = WorkerConfig::builder()
            .worker_id("w1")
            .max_concurrent_tasks(0)
            .build();
        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.max_concurrent_tasks, 1);
    }
}
