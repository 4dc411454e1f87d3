//! `audio_generation` handler: text in, one compressed audio artifact out

use crate::artifacts::friendly_path;
use crate::audio::chunker::{SpeechChunker, DEFAULT_CHUNK_MAX_LEN};
use crate::audio::synthesis::{SpeechSynthesizer, SynthesisConfig};
use crate::audio::transcode::{LoudnessTarget, Transcoder};
use crate::audio::tts::SpeechProvider;
use crate::audio::wav::parse_wav;
use crate::db::{ArtifactType, Task, TaskStatus, TaskType};
use crate::error::{Result, WorkerError};
use crate::worker::{
    ClaimedTask, NewArtifact, TaskContext, TaskHandler, TaskOutcome, TaskPayload, TextSource,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Audio pipeline configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Max chars per synthesis call
    pub chunk_max_len: usize,
    pub synthesis: SynthesisConfig,
    pub loudness: LoudnessTarget,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            chunk_max_len: DEFAULT_CHUNK_MAX_LEN,
            synthesis: SynthesisConfig::default(),
            loudness: LoudnessTarget::default(),
        }
    }
}

/// Chunks, synthesizes, concatenates and transcodes one document per task
pub struct AudioTaskProcessor {
    chunker: SpeechChunker,
    synthesizer: SpeechSynthesizer,
    transcoder: Arc<dyn Transcoder>,
    loudness: LoudnessTarget,
}

impl AudioTaskProcessor {
    pub fn new(
        provider: Arc<dyn SpeechProvider>,
        transcoder: Arc<dyn Transcoder>,
        config: AudioConfig,
    ) -> Result<Self> {
        Ok(Self {
            chunker: SpeechChunker::new(config.chunk_max_len)?,
            synthesizer: SpeechSynthesizer::new(provider, config.synthesis),
            transcoder,
            loudness: config.loudness,
        })
    }

    /// Load the text to narrate
    ///
    /// Sibling outputs are only read once the sibling is complete; anything
    /// else is reported as not ready so the task is retried later.
    pub async fn resolve_text(&self, ctx: &TaskContext, task: &Task, source: &TextSource) -> Result<String> {
        match source {
            TextSource::Inline(text) => Ok(text.clone()),
            TextSource::ArtifactPath(path) => read_text_artifact(ctx, path).await,
            TextSource::SiblingSequence(sequence) => {
                let siblings = ctx.store.list_job_tasks(task.job_id).await?;
                let sibling = siblings
                    .iter()
                    .find(|t| {
                        t.sequence == *sequence && t.task_type == TaskType::TextGeneration.as_str()
                    })
                    .ok_or_else(|| {
                        WorkerError::DependencyNotReady(format!(
                            "text task #{} for job {} does not exist yet",
                            sequence, task.job_id
                        ))
                    })?;

                match sibling.status() {
                    Some(TaskStatus::Complete) => {}
                    Some(TaskStatus::Failed) => {
                        return Err(WorkerError::Validation(format!(
                            "source text task {} failed",
                            sibling.id
                        )));
                    }
                    _ => {
                        return Err(WorkerError::DependencyNotReady(format!(
                            "text task {} is {}",
                            sibling.id, sibling.status
                        )));
                    }
                }

                let output = sibling.output.as_ref().ok_or_else(|| {
                    WorkerError::Validation(format!("text task {} has no output", sibling.id))
                })?;
                if let Some(text) = output.get("text").and_then(|v| v.as_str()) {
                    return Ok(text.to_string());
                }
                if let Some(path) = output.get("artifact_path").and_then(|v| v.as_str()) {
                    return read_text_artifact(ctx, path).await;
                }
                Err(WorkerError::Validation(format!(
                    "text task {} output has neither text nor artifact_path",
                    sibling.id
                )))
            }
        }
    }
}

async fn read_text_artifact(ctx: &TaskContext, path: &str) -> Result<String> {
    let bytes = match ctx.artifacts.get(path).await {
        Ok(bytes) => bytes,
        Err(WorkerError::NotFound(what)) => return Err(WorkerError::DependencyNotReady(what)),
        Err(e) => return Err(e),
    };
    String::from_utf8(bytes)
        .map_err(|_| WorkerError::Validation(format!("artifact '{}' is not UTF-8 text", path)))
}

#[async_trait]
impl TaskHandler for AudioTaskProcessor {
    fn task_types(&self) -> Vec<TaskType> {
        vec![TaskType::AudioGeneration]
    }

    async fn process(&self, ctx: &TaskContext, claimed: &ClaimedTask) -> Result<TaskOutcome> {
        let TaskPayload::AudioGeneration(input) = &claimed.payload else {
            return Err(WorkerError::Validation(format!(
                "audio processor cannot handle {}",
                claimed.payload.task_type().as_str()
            )));
        };
        let task = &claimed.task;

        let text = self.resolve_text(ctx, task, &input.source).await?;
        let chunks = self.chunker.split(&text);
        if chunks.is_empty() {
            return Err(WorkerError::Validation("source text is empty".to_string()));
        }
        info!(
            "Task {}: {} chars in {} chunk(s) (max {})",
            task.id,
            text.chars().count(),
            chunks.len(),
            self.chunker.max_len()
        );

        let wav = self
            .synthesizer
            .synthesize_document(&chunks, &input.voice, input.intro.as_deref())
            .await?;
        let duration = parse_wav(&wav)?.duration();

        let compressed = self
            .transcoder
            .transcode(&wav, input.codec, self.loudness)
            .await?;
        info!(
            "Task {}: {:.1}s of audio, {} bytes WAV -> {} bytes {}",
            task.id,
            duration.as_secs_f64(),
            wav.len(),
            compressed.len(),
            input.codec.extension()
        );

        let friendly = match &input.deliverable {
            Some(label) => {
                let job_type = ctx
                    .store
                    .get_job(task.job_id)
                    .await?
                    .map(|job| job.job_type)
                    .unwrap_or_else(|| "job".to_string());
                Some(friendly_path(
                    &label.person,
                    &job_type,
                    &label.system,
                    &label.document,
                    input.codec.extension(),
                ))
            }
            None => None,
        };

        let metadata = json!({
            "duration_seconds": duration.as_secs_f64(),
            "chunks": chunks.len(),
            "codec": input.codec,
            "voice": input.voice.voice,
        });

        Ok(TaskOutcome::new(json!({
            "chunks": chunks.len(),
            "duration_seconds": duration.as_secs_f64(),
            "codec": input.codec,
        }))
        .with_artifact(NewArtifact {
            artifact_type: ArtifactType::Audio,
            bytes: compressed,
            content_type: input.codec.content_type().to_string(),
            extension: input.codec.extension().to_string(),
            metadata,
            friendly_path: friendly,
        }))
    }
}
