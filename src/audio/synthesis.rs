//! Paced, retrying speech synthesis over a chunk list

use crate::audio::tts::{SpeechProvider, VoiceParams};
use crate::audio::wav::{concatenate_wav_buffers, decode_pcm16, silence};
use crate::error::{Result, WorkerError};
use crate::worker::backoff::exponential_delay;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Synthesis configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Minimum gap between any two provider calls
    pub inter_chunk_delay: Duration,

    /// Retries per chunk after the first attempt
    pub chunk_retries: u32,

    /// Initial delay between retries (doubles each retry)
    pub retry_base_delay: Duration,

    /// Maximum delay between retries
    pub retry_max_delay: Duration,

    /// Chunks in flight at once; 1 is strictly sequential
    pub concurrency: usize,

    /// Silence before and after the intro
    pub intro_padding: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            inter_chunk_delay: Duration::from_millis(1500),
            chunk_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(30),
            concurrency: 1,
            intro_padding: Duration::from_millis(750),
        }
    }
}

/// Spaces calls at least `min_gap` apart, across every caller sharing it
#[derive(Debug)]
pub struct Pacer {
    min_gap: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for the next free slot and reserve the one after it
    pub async fn wait(&self) {
        let mut next = self.next_slot.lock().await;
        if let Some(slot) = *next {
            if slot > Instant::now() {
                sleep_until(slot).await;
            }
        }
        *next = Some(Instant::now() + self.min_gap);
    }
}

/// Drives a [`SpeechProvider`] over a list of chunks
pub struct SpeechSynthesizer {
    provider: Arc<dyn SpeechProvider>,
    config: SynthesisConfig,
    pacer: Arc<Pacer>,
}

impl SpeechSynthesizer {
    pub fn new(provider: Arc<dyn SpeechProvider>, config: SynthesisConfig) -> Self {
        let pacer = Arc::new(Pacer::new(config.inter_chunk_delay));
        Self {
            provider,
            config,
            pacer,
        }
    }

    /// Share a pacer with other synthesizers hitting the same provider
    pub fn with_pacer(mut self, pacer: Arc<Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Synthesize one chunk, retrying transient failures
    ///
    /// Fatal provider errors are returned on the first occurrence.
    pub async fn synthesize_chunk(&self, index: usize, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        self.synthesize_with_retry(&format!("chunk {}", index + 1), text, voice)
            .await
    }

    async fn synthesize_with_retry(&self, label: &str, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        let mut last_error = String::new();
        let mut retry_after = None;

        for attempt in 0..=self.config.chunk_retries {
            if attempt > 0 {
                let delay = retry_after.unwrap_or_else(|| {
                    exponential_delay(
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                        attempt,
                    )
                });
                warn!(
                    "Retry attempt {}/{} for {} after {:?}",
                    attempt, self.config.chunk_retries, label, delay
                );
                sleep(delay).await;
            }

            self.pacer.wait().await;
            match self.provider.synthesize(text, voice).await {
                Ok(wav) => {
                    if attempt > 0 {
                        info!("Synthesized {} on attempt {}", label, attempt + 1);
                    }
                    return Ok(wav);
                }
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                    retry_after = e.retry_after();
                    warn!(
                        "Synthesis attempt {} failed for {}: {}",
                        attempt + 1,
                        label,
                        last_error
                    );
                }
                Err(e) => {
                    warn!("Synthesis of {} failed with a non-retryable error: {}", label, e);
                    return Err(e);
                }
            }
        }

        Err(WorkerError::RetryExhausted {
            target: label.to_string(),
            attempts: self.config.chunk_retries + 1,
            last_error,
        })
    }

    /// Synthesize every chunk, returning WAV buffers in chunk order
    pub async fn synthesize_all(&self, chunks: &[String], voice: &VoiceParams) -> Result<Vec<Vec<u8>>> {
        info!(
            "Synthesizing {} chunk(s) with concurrency {}",
            chunks.len(),
            self.config.concurrency.max(1)
        );
        let calls: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(index, text)| self.synthesize_chunk(index, text, voice))
            .collect();
        stream::iter(calls)
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await
    }

    /// Synthesize the optional intro and every chunk into one 16-bit PCM WAV
    pub async fn synthesize_document(
        &self,
        chunks: &[String],
        voice: &VoiceParams,
        intro: Option<&str>,
    ) -> Result<Vec<u8>> {
        if chunks.is_empty() {
            return Err(WorkerError::Audio("no text to synthesize".to_string()));
        }

        let intro_wav = match intro.map(str::trim).filter(|s| !s.is_empty()) {
            Some(text) => {
                debug!("Synthesizing intro ({} chars)", text.chars().count());
                Some(self.synthesize_with_retry("intro", text, voice).await?)
            }
            None => None,
        };

        let body = self.synthesize_all(chunks, voice).await?;

        let mut parts = Vec::with_capacity(body.len() + 3);
        if let Some(intro_wav) = intro_wav {
            let layout = decode_pcm16(&intro_wav)?;
            let pad = silence(layout.sample_rate, layout.channels, self.config.intro_padding)?;
            parts.push(pad.clone());
            parts.push(intro_wav);
            parts.push(pad);
        }
        parts.extend(body);

        concatenate_wav_buffers(&parts)
    }
}
