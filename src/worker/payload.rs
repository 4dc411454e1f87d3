//! Typed task inputs
//!
//! `job_tasks.input` is validated into a [`TaskPayload`] when a task is
//! dequeued, before any handler sees it. A payload that does not match its
//! task type is a [`WorkerError::Validation`] and fails the task permanently.

use crate::audio::transcode::Codec;
use crate::audio::tts::VoiceParams;
use crate::db::TaskType;
use crate::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};

/// Input for a `text_generation` task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextGenerationInput {
    /// Name of the content template to render
    pub template: String,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// Where an `audio_generation` task gets its text from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    /// Text supplied inline
    Inline(String),
    /// A stored text artifact
    ArtifactPath(String),
    /// The output of the sibling `text_generation` task with this sequence
    SiblingSequence(i32),
}

/// Labels used to build the user-facing deliverable path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverableLabel {
    pub person: String,
    pub system: String,
    pub document: String,
}

/// Input for an `audio_generation` task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioGenerationInput {
    pub source: TextSource,
    #[serde(default)]
    pub voice: VoiceParams,
    /// Spoken introduction synthesized before the body
    #[serde(default)]
    pub intro: Option<String>,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub deliverable: Option<DeliverableLabel>,
}

/// Input for a `pdf_generation` task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfGenerationInput {
    /// Sibling text tasks whose outputs make up the document, in order
    pub source_sequences: Vec<i32>,
    #[serde(default)]
    pub deliverable: Option<DeliverableLabel>,
}

/// Validated task input, keyed by task type
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    TextGeneration(TextGenerationInput),
    AudioGeneration(AudioGenerationInput),
    PdfGeneration(PdfGenerationInput),
}

impl TaskPayload {
    /// Decode and validate `input` for the given `task_type` column value
    pub fn parse(task_type: &str, input: &serde_json::Value) -> Result<Self> {
        let task_type = TaskType::parse(task_type)
            .ok_or_else(|| WorkerError::Validation(format!("unknown task type '{}'", task_type)))?;

        let payload = match task_type {
            TaskType::TextGeneration => TaskPayload::TextGeneration(decode(task_type, input)?),
            TaskType::AudioGeneration => TaskPayload::AudioGeneration(decode(task_type, input)?),
            TaskType::PdfGeneration => TaskPayload::PdfGeneration(decode(task_type, input)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::TextGeneration(_) => TaskType::TextGeneration,
            TaskPayload::AudioGeneration(_) => TaskType::AudioGeneration,
            TaskPayload::PdfGeneration(_) => TaskType::PdfGeneration,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            TaskPayload::TextGeneration(input) => {
                if input.template.trim().is_empty() {
                    return Err(WorkerError::Validation("template must not be empty".into()));
                }
            }
            TaskPayload::AudioGeneration(input) => {
                match &input.source {
                    TextSource::Inline(text) if text.trim().is_empty() => {
                        return Err(WorkerError::Validation("inline text must not be empty".into()));
                    }
                    TextSource::ArtifactPath(path) if path.trim().is_empty() => {
                        return Err(WorkerError::Validation("artifact path must not be empty".into()));
                    }
                    TextSource::SiblingSequence(seq) if *seq < 0 => {
                        return Err(WorkerError::Validation(format!(
                            "sibling sequence must be non-negative, got {}",
                            seq
                        )));
                    }
                    _ => {}
                }
                if input.voice.voice.trim().is_empty() {
                    return Err(WorkerError::Validation("voice must not be empty".into()));
                }
            }
            TaskPayload::PdfGeneration(input) => {
                if input.source_sequences.is_empty() {
                    return Err(WorkerError::Validation(
                        "source_sequences must not be empty".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(task_type: TaskType, input: &serde_json::Value) -> Result<T> {
    serde_json::from_value(input.clone()).map_err(|e| {
        WorkerError::Validation(format!("malformed {} input: {}", task_type.as_str(), e))
    })
}
