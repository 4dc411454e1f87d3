//! WAV to compressed audio via ffmpeg

use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Output container/codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Mp3,
    Opus,
    M4a,
}

impl Codec {
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Mp3 => "mp3",
            Codec::Opus => "ogg",
            Codec::M4a => "m4a",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Mp3 => "audio/mpeg",
            Codec::Opus => "audio/ogg",
            Codec::M4a => "audio/mp4",
        }
    }

    fn encoder_args(&self) -> &'static [&'static str] {
        match self {
            Codec::Mp3 => &["-c:a", "libmp3lame", "-b:a", "128k", "-f", "mp3"],
            Codec::Opus => &["-c:a", "libopus", "-b:a", "64k", "-f", "ogg"],
            // mp4 on a pipe needs a fragmented layout
            Codec::M4a => &[
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-movflags",
                "frag_keyframe+empty_moov",
                "-f",
                "mp4",
            ],
        }
    }
}

/// EBU R128 loudness normalization target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessTarget {
    /// Integrated loudness, LUFS
    pub integrated: f32,
    /// True peak, dBTP
    pub true_peak: f32,
    /// Loudness range, LU
    pub range: f32,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            integrated: -16.0,
            true_peak: -1.5,
            range: 11.0,
        }
    }
}

impl LoudnessTarget {
    /// ffmpeg `loudnorm` filter expression
    pub fn filter(&self) -> String {
        format!(
            "loudnorm=I={}:TP={}:LRA={}",
            self.integrated, self.true_peak, self.range
        )
    }
}

/// Converts WAV bytes to a compressed container
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, wav: &[u8], codec: Codec, loudness: LoudnessTarget) -> Result<Vec<u8>>;
}

/// Arguments for a stdin-to-stdout ffmpeg run
pub fn ffmpeg_args(codec: Codec, loudness: LoudnessTarget) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "wav",
        "-i",
        "pipe:0",
        "-af",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(loudness.filter());
    args.extend(codec.encoder_args().iter().map(|s| s.to_string()));
    args.push("pipe:1".to_string());
    args
}

/// Runs the `ffmpeg` binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Find `ffmpeg` on PATH
    pub fn locate() -> Result<Self> {
        let binary = which::which("ffmpeg")
            .map_err(|e| WorkerError::ConfigError(format!("ffmpeg not found on PATH: {}", e)))?;
        info!("Using ffmpeg at {}", binary.display());
        Ok(Self::new(binary))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, wav: &[u8], codec: Codec, loudness: LoudnessTarget) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.binary)
            .args(ffmpeg_args(codec, loudness))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Transcode(format!("failed to start ffmpeg: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Transcode("ffmpeg stdin unavailable".to_string()))?;
        let input = wav.to_vec();
        // stdin is fed while stdout drains
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WorkerError::Transcode(format!("ffmpeg did not finish: {}", e)))?;

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("ffmpeg closed stdin early: {}", e),
            Err(e) => debug!("ffmpeg stdin writer aborted: {}", e),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.chars().rev().take(500).collect::<Vec<_>>().into_iter().rev().collect();
            return Err(WorkerError::Transcode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                tail.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(WorkerError::Transcode("ffmpeg produced no output".to_string()));
        }

        debug!(
            "Transcoded {} bytes of WAV to {} bytes of {}",
            wav.len(),
            output.stdout.len(),
            codec.extension()
        );
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_loudness_filter() {
        assert_eq!(
            LoudnessTarget::default().filter(),
            "loudnorm=I=-16:TP=-1.5:LRA=11"
        );
    }

    #[test]
    fn mp3_args_read_stdin_and_write_stdout() {
        let args = ffmpeg_args(Codec::Mp3, LoudnessTarget::default());
        let joined = args.join(" ");
        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-af loudnorm=I=-16:TP=-1.5:LRA=11"));
        assert!(joined.contains("-c:a libmp3lame"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn codec_metadata() {
        assert_eq!(Codec::default(), Codec::Mp3);
        assert_eq!(Codec::Opus.extension(), "ogg");
        assert_eq!(Codec::M4a.content_type(), "audio/mp4");
        let codec: Codec = serde_json::from_str("\"opus\"").unwrap();
        assert_eq!(codec, Codec::Opus);
    }

    #[tokio::test]
    async fn missing_binary_is_a_transcode_error() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary");
        let err = transcoder
            .transcode(b"RIFF", Codec::Mp3, LoudnessTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Transcode(_)));
    }
}
