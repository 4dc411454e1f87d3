//! Completion notifications dispatched by the watchdog

use crate::db::Job;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use url::Url;

/// Receives completed jobs. Called at most once per job unless it returns an error.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn notify_complete(&self, job: &Job) -> Result<()>;
}

/// Logs completions only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl JobNotifier for LogNotifier {
    async fn notify_complete(&self, job: &Job) -> Result<()> {
        info!("Job {} ({}) complete", job.id, job.job_type);
        Ok(())
    }
}

#[derive(Serialize)]
struct CompletionEvent<'a> {
    event: &'static str,
    job_id: uuid::Uuid,
    job_type: &'a str,
    status: &'a str,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// POSTs a JSON completion event to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, secret: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            url: Url::parse(url)?,
            secret,
        })
    }
}

#[async_trait]
impl JobNotifier for WebhookNotifier {
    async fn notify_complete(&self, job: &Job) -> Result<()> {
        let event = CompletionEvent {
            event: "job.complete",
            job_id: job.id,
            job_type: &job.job_type,
            status: &job.status,
            completed_at: job.completed_at,
        };

        let mut request = self.client.post(self.url.clone()).json(&event);
        if let Some(secret) = &self.secret {
            request = request.header("x-webhook-secret", secret);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::from_provider_status(status.as_u16(), body, None));
        }

        info!("Notified webhook of job {} completion", job.id);
        Ok(())
    }
}
