//! In-memory artifact store used by tests and `--memory` runs

use crate::artifacts::ArtifactStore;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly
    pub fn insert(&self, path: &str, bytes: Vec<u8>, content_type: &str) {
        self.lock()
            .insert(path.to_string(), (bytes, content_type.to_string()));
    }

    /// Stored paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn content_type(&self, path: &str) -> Option<String> {
        self.lock().get(path).map(|(_, ct)| ct.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, String)>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        self.insert(path, bytes, content_type);
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.lock()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| WorkerError::NotFound(format!("artifact '{}'", path)))
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        if !self.lock().contains_key(path) {
            return Err(WorkerError::NotFound(format!("artifact '{}'", path)));
        }
        Ok(format!("memory://{}?ttl={}", path, ttl.as_secs()))
    }
}
