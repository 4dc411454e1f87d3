//! Storage path conventions
//!
//! Deterministic paths derive from the task id alone, so a downstream task can
//! reference an artifact before any listing sees it. Friendly paths carry
//! human-readable labels and are only used for final deliverables.

use crate::db::ArtifactType;
use crate::error::{Result, WorkerError};
use uuid::Uuid;

/// `jobs/{job_id}/tasks/{task_id}/{artifact_type}.{ext}`
pub fn deterministic_path(job_id: Uuid, task_id: Uuid, artifact_type: ArtifactType, ext: &str) -> String {
    format!(
        "jobs/{}/tasks/{}/{}.{}",
        job_id,
        task_id,
        artifact_type.as_str(),
        ext.trim_start_matches('.')
    )
}

/// `{person}/{job_type}/{system}-{document}.{ext}`, every label slugified
pub fn friendly_path(person: &str, job_type: &str, system: &str, document: &str, ext: &str) -> String {
    format!(
        "{}/{}/{}-{}.{}",
        slugify(person),
        slugify(job_type),
        slugify(system),
        slugify(document),
        ext.trim_start_matches('.')
    )
}

/// Lowercase, spaces/dots/underscores to dashes, drop everything else non-alphanumeric
pub fn slugify(label: &str) -> String {
    let slug: String = label
        .to_lowercase()
        .replace([' ', '.', '_'], "-")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect();

    let mut collapsed = String::with_capacity(slug.len());
    for c in slug.chars() {
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }

    let collapsed = collapsed.trim_matches('-').to_string();
    if collapsed.is_empty() {
        "unknown".to_string()
    } else {
        collapsed
    }
}

/// Reject paths that could escape the store root
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(WorkerError::Storage(format!("invalid artifact path '{}'", path)));
    }
    Ok(())
}
