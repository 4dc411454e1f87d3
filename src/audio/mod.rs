//! Audio assembly pipeline
//!
//! text -> chunks -> paced synthesis -> 16-bit PCM concatenation -> loudness
//! normalized compressed audio.

pub mod chunker;
pub mod processor;
pub mod synthesis;
pub mod transcode;
pub mod tts;
pub mod wav;

pub use chunker::{split_into_chunks, SpeechChunker, DEFAULT_CHUNK_MAX_LEN};
pub use processor::{AudioConfig, AudioTaskProcessor};
pub use synthesis::{Pacer, SpeechSynthesizer, SynthesisConfig};
pub use transcode::{Codec, FfmpegTranscoder, LoudnessTarget, Transcoder};
pub use tts::{HttpSpeechConfig, HttpSpeechProvider, SpeechProvider, VoiceParams};
pub use wav::{
    concatenate_wav_buffers, convert_float_wav_to_pcm, decode_pcm16, encode_pcm16, parse_wav, silence,
};
