//! Speech-synthesis provider client

use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default speech endpoint (OpenAI-compatible)
pub const DEFAULT_TTS_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Default speech model
pub const DEFAULT_TTS_MODEL: &str = "gpt-4o-mini-tts";

/// Voice selection passed through to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub speed: Option<f32>,
    /// Style instructions for models that accept them
    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_voice() -> String {
    "alloy".to_string()
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            speed: None,
            instructions: None,
        }
    }
}

/// Turns one text chunk into WAV bytes
///
/// Implementations raise [`WorkerError::ProviderTransient`] for failures worth
/// retrying and [`WorkerError::ProviderFatal`] for everything else.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>>;
}

/// HTTP provider settings
#[derive(Debug, Clone)]
pub struct HttpSpeechConfig {
    pub endpoint: Url,
    pub api_key: String,
    pub model: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpSpeechConfig {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Result<Self> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            api_key: api_key.to_string(),
            model: model.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        })
    }

    /// Read `TTS_API_KEY` (or `OPENAI_API_KEY`), `TTS_API_URL` and `TTS_MODEL`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| WorkerError::ConfigError("TTS_API_KEY not set".to_string()))?;
        let endpoint = std::env::var("TTS_API_URL").unwrap_or_else(|_| DEFAULT_TTS_URL.to_string());
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| DEFAULT_TTS_MODEL.to_string());
        Self::new(&endpoint, &api_key, &model)
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}

/// JSON envelope some providers wrap base64 audio in
#[derive(Deserialize)]
struct AudioEnvelope {
    #[serde(alias = "data", alias = "audio_content")]
    audio: String,
}

/// Provider reached over HTTP
pub struct HttpSpeechProvider {
    client: Client,
    config: HttpSpeechConfig,
}

impl HttpSpeechProvider {
    pub fn new(config: HttpSpeechConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        let request = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: &voice.voice,
            response_format: "wav",
            speed: voice.speed,
            instructions: voice.instructions.as_deref(),
        };

        let response = self
            .client
            .post(self.config.endpoint.clone())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| WorkerError::ProviderTransient {
                status: None,
                message: format!("request failed: {}", e),
                retry_after: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::from_provider_status(
                status.as_u16(),
                truncate(&body, 500),
                retry_after,
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(|e| WorkerError::ProviderTransient {
            status: Some(status.as_u16()),
            message: format!("reading audio body failed: {}", e),
            retry_after: None,
        })?;

        let audio = decode_audio_body(&content_type, &body)?;
        debug!("Synthesized {} chars into {} bytes", text.chars().count(), audio.len());
        Ok(audio)
    }
}

/// Extract WAV bytes from a raw or base64-JSON response body
pub fn decode_audio_body(content_type: &str, body: &[u8]) -> Result<Vec<u8>> {
    let audio = if content_type.starts_with("application/json") {
        let envelope: AudioEnvelope =
            serde_json::from_slice(body).map_err(|e| undecodable(format!("bad JSON envelope: {}", e)))?;
        base64::engine::general_purpose::STANDARD
            .decode(envelope.audio.trim())
            .map_err(|e| undecodable(format!("bad base64 audio: {}", e)))?
    } else {
        body.to_vec()
    };

    if audio.len() < 12 || &audio[0..4] != b"RIFF" {
        return Err(undecodable("response is not a WAV container".to_string()));
    }
    Ok(audio)
}

/// Providers occasionally return garbage under load; treat it as retryable
fn undecodable(message: String) -> WorkerError {
    WorkerError::ProviderTransient {
        status: None,
        message,
        retry_after: None,
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
