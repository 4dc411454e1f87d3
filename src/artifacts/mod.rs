//! Artifact storage
//!
//! Bytes go to an object store behind [`ArtifactStore`]; the matching row in
//! `job_artifacts` is written by the worker after the upload succeeds.

pub mod http;
pub mod local;
pub mod memory;
pub mod paths;

use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub use http::{HttpArtifactStore, HttpStorageConfig};
pub use local::LocalArtifactStore;
pub use memory::MemoryArtifactStore;
pub use paths::{deterministic_path, friendly_path, slugify};

/// Object storage for artifact bytes
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` at `path`, replacing any existing object. Returns the stored path.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Time-limited URL for downloading `path`
    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String>;
}

/// SHA-256 of the artifact bytes, hex encoded
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
