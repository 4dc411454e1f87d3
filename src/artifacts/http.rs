//! Object storage over the Supabase Storage REST API

use crate::artifacts::paths::validate_path;
use crate::artifacts::ArtifactStore;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Connection settings for the storage API
#[derive(Debug, Clone)]
pub struct HttpStorageConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub base_url: Url,
    pub bucket: String,
    /// Service-role key, sent as bearer token and `apikey`
    pub service_key: String,
    pub request_timeout: Duration,
}

impl HttpStorageConfig {
    pub fn new(base_url: &str, bucket: &str, service_key: &str) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            bucket: bucket.to_string(),
            service_key: service_key.to_string(),
            request_timeout: Duration::from_secs(120),
        })
    }

    /// Read `SUPABASE_URL`, `SUPABASE_SERVICE_ROLE_KEY` and `ARTIFACT_BUCKET` (default `artifacts`)
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("SUPABASE_URL")
            .map_err(|_| WorkerError::ConfigError("SUPABASE_URL not set".to_string()))?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE_KEY").map_err(|_| {
            WorkerError::ConfigError("SUPABASE_SERVICE_ROLE_KEY not set".to_string())
        })?;
        let bucket = std::env::var("ARTIFACT_BUCKET").unwrap_or_else(|_| "artifacts".to_string());
        Self::new(&base_url, &bucket, &key)
    }
}

/// Artifact store backed by a storage bucket
pub struct HttpArtifactStore {
    client: Client,
    config: HttpStorageConfig,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl HttpArtifactStore {
    pub fn new(config: HttpStorageConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, kind: &str, path: &str) -> Result<Url> {
        validate_path(path)?;
        let base = self.config.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!(
            "{}/storage/v1/{}/{}/{}",
            base, kind, self.config.bucket, path
        ))?)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.config.service_key)
            .header("apikey", &self.config.service_key)
    }
}

async fn storage_error(op: &str, path: &str, response: reqwest::Response) -> WorkerError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return WorkerError::NotFound(format!("artifact '{}'", path));
    }
    WorkerError::Storage(format!("{} '{}' failed with HTTP {}: {}", op, path, status.as_u16(), body))
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = self.endpoint("object", path)?;
        let size = bytes.len();
        let response = self
            .authorized(self.client.post(url))
            .header("content-type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(storage_error("upload", path, response).await);
        }

        info!("Uploaded {} ({} bytes, {})", path, size, content_type);
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.endpoint("object", path)?;
        let response = self.authorized(self.client.get(url)).send().await?;
        if !response.status().is_success() {
            return Err(storage_error("download", path, response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        let url = self.endpoint("object/sign", path)?;
        let response = self
            .authorized(self.client.post(url))
            .json(&serde_json::json!({ "expiresIn": ttl.as_secs() }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(storage_error("sign", path, response).await);
        }

        let signed: SignResponse = response.json().await?;
        let base = self.config.base_url.as_str().trim_end_matches('/');
        debug!("Signed {} for {:?}", path, ttl);
        Ok(format!("{}/storage/v1{}", base, signed.signed_url))
    }
}
