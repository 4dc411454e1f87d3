//! Filesystem artifact store for local runs

use crate::artifacts::paths::validate_path;
use crate::artifacts::ArtifactStore;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Stores artifacts under a root directory
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial file
        let tmp = target.with_extension("partial");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;

        debug!("Stored {} bytes at {}", bytes.len(), target.display());
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkerError::NotFound(format!("artifact '{}'", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        let target = self.resolve(path)?;
        let absolute = if target.is_absolute() {
            target
        } else {
            std::env::current_dir()?.join(target)
        };
        let mut url = url::Url::from_file_path(&absolute)
            .map_err(|_| WorkerError::Storage(format!("cannot build file URL for '{}'", path)))?;
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        url.query_pairs_mut().append_pair("expires", &expires.to_string());
        Ok(url.to_string())
    }
}
