//! WAV decoding, float-to-PCM conversion and concatenation
//!
//! Providers return WAV containers that may carry 32-bit float samples and
//! extra chunks (`LIST`, `fact`, ...). Everything is normalized to 16-bit PCM
//! before concatenation. Decoding goes through `hound`; the RIFF walker below
//! covers what hound rejects (streaming data sizes, truncated bodies, 64-bit
//! float). Output is always written by `hound::WavWriter`.

use crate::error::{Result, WorkerError};
use std::io::Cursor;
use std::time::Duration;

/// Header length of a mono or stereo 16-bit PCM file
pub const WAV_HEADER_LEN: usize = 44;

pub const FORMAT_PCM: u16 = 0x0001;
pub const FORMAT_IEEE_FLOAT: u16 = 0x0003;
pub const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

pub const MAX_CHANNELS: u16 = 8;
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Declared size used by streaming encoders that do not know the length up front
const STREAMING_SIZE: u32 = 0xFFFF_FFFF;

/// Contents of the `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    /// Effective format code (the sub-format for `WAVE_FORMAT_EXTENSIBLE`)
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub block_align: u16,
}

impl WavFormat {
    pub fn is_pcm16(&self) -> bool {
        self.audio_format == FORMAT_PCM && self.bits_per_sample == 16
    }

    pub fn is_float(&self) -> bool {
        self.audio_format == FORMAT_IEEE_FLOAT
    }
}

/// A RIFF-walked WAV file borrowing its sample data
#[derive(Debug, Clone, Copy)]
pub struct ParsedWav<'a> {
    pub format: WavFormat,
    pub data: &'a [u8],
}

impl ParsedWav<'_> {
    pub fn duration(&self) -> Duration {
        let bytes_per_sec = u64::from(self.format.sample_rate) * u64::from(self.format.block_align);
        if bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.data.len() as f64 / bytes_per_sec as f64)
    }
}

/// Interleaved 16-bit samples with their layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedWav {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl DecodedWav {
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / usize::from(self.channels.max(1));
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Reject layouts no speech provider produces (and that would overflow rate math)
fn check_layout(channels: u16, sample_rate: u32) -> Result<()> {
    if channels == 0 || channels > MAX_CHANNELS || sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE
    {
        return Err(WorkerError::Audio(format!(
            "unsupported layout: {} channel(s) at {} Hz",
            channels, sample_rate
        )));
    }
    Ok(())
}

/// Walk the RIFF chunks and return the format and sample data
pub fn parse_wav(bytes: &[u8]) -> Result<ParsedWav<'_>> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(WorkerError::Audio("not a RIFF/WAVE file".to_string()));
    }

    let mut format = None;
    let mut offset = 12;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let declared = read_u32(bytes, offset + 4);
        let body_start = offset + 8;
        let remaining = bytes.len() - body_start;

        if id == b"data" {
            let fmt: WavFormat = format
                .ok_or_else(|| WorkerError::Audio("data chunk before fmt chunk".to_string()))?;
            // Streaming writers leave the size unset; truncated bodies are clamped
            let len = if declared == STREAMING_SIZE {
                remaining
            } else {
                (declared as usize).min(remaining)
            };
            let block = usize::from(fmt.block_align.max(1));
            let len = len - len % block;
            return Ok(ParsedWav {
                format: fmt,
                data: &bytes[body_start..body_start + len],
            });
        }

        let size = declared as usize;
        if size > remaining {
            return Err(WorkerError::Audio(format!(
                "chunk '{}' overruns the file",
                String::from_utf8_lossy(id)
            )));
        }

        if id == b"fmt " {
            format = Some(parse_fmt(&bytes[body_start..body_start + size])?);
        }

        // Chunks are word aligned
        offset = body_start + size + (size & 1);
    }

    Err(WorkerError::Audio("missing data chunk".to_string()))
}

fn parse_fmt(body: &[u8]) -> Result<WavFormat> {
    if body.len() < 16 {
        return Err(WorkerError::Audio(format!("fmt chunk too short ({} bytes)", body.len())));
    }

    let mut audio_format = read_u16(body, 0);
    let channels = read_u16(body, 2);
    let sample_rate = read_u32(body, 4);
    let block_align = read_u16(body, 12);
    let bits_per_sample = read_u16(body, 14);

    if audio_format == FORMAT_EXTENSIBLE {
        // cbSize(2) validBits(2) channelMask(4) then the SubFormat GUID
        if body.len() < 40 {
            return Err(WorkerError::Audio("extensible fmt chunk too short".to_string()));
        }
        audio_format = read_u16(body, 24);
    }

    check_layout(channels, sample_rate)?;
    if bits_per_sample == 0 {
        return Err(WorkerError::Audio("invalid format: 0 bits per sample".to_string()));
    }

    Ok(WavFormat {
        audio_format,
        channels,
        sample_rate,
        bits_per_sample,
        block_align,
    })
}

/// Scale a float sample to i16, clamping instead of wrapping. NaN maps to 0.
pub fn float_to_pcm16(sample: f64) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Decode any supported WAV into 16-bit samples
pub fn decode_pcm16(bytes: &[u8]) -> Result<DecodedWav> {
    let decoded = match decode_with_hound(bytes) {
        Ok(decoded) => decoded,
        Err(_) => decode_with_walker(bytes)?,
    };
    check_layout(decoded.channels, decoded.sample_rate)?;
    Ok(decoded)
}

fn decode_with_hound(bytes: &[u8]) -> std::result::Result<DecodedWav, hound::Error> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| float_to_pcm16(f64::from(v))))
            .collect::<std::result::Result<Vec<_>, _>>()?,
        _ => return Err(hound::Error::Unsupported),
    };
    Ok(DecodedWav {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        samples,
    })
}

fn decode_with_walker(bytes: &[u8]) -> Result<DecodedWav> {
    let wav = parse_wav(bytes)?;
    let format = wav.format;

    let samples = if format.is_pcm16() {
        wav.data
            .chunks_exact(2)
            .map(|s| i16::from_le_bytes([s[0], s[1]]))
            .collect()
    } else if format.is_float() && format.bits_per_sample == 32 {
        wav.data
            .chunks_exact(4)
            .map(|s| float_to_pcm16(f64::from(f32::from_le_bytes([s[0], s[1], s[2], s[3]]))))
            .collect()
    } else if format.is_float() && format.bits_per_sample == 64 {
        wav.data
            .chunks_exact(8)
            .map(|s| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(s);
                float_to_pcm16(f64::from_le_bytes(raw))
            })
            .collect()
    } else {
        return Err(WorkerError::Audio(format!(
            "unsupported sample format 0x{:04x} at {} bits",
            format.audio_format, format.bits_per_sample
        )));
    };

    Ok(DecodedWav {
        sample_rate: format.sample_rate,
        channels: format.channels,
        samples,
    })
}

/// Write 16-bit PCM samples as a WAV file
pub fn encode_pcm16(sample_rate: u32, channels: u16, samples: &[i16]) -> Result<Vec<u8>> {
    check_layout(channels, sample_rate)?;
    if samples.len().saturating_mul(2) > (u32::MAX - 36) as usize {
        return Err(WorkerError::Audio("audio exceeds WAV size limit".to_string()));
    }

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Re-encode any supported WAV as 16-bit PCM
pub fn convert_float_wav_to_pcm(bytes: &[u8]) -> Result<Vec<u8>> {
    let wav = decode_pcm16(bytes)?;
    encode_pcm16(wav.sample_rate, wav.channels, &wav.samples)
}

/// Join WAV buffers in order into one file
///
/// Every input is normalized to 16-bit PCM first; all inputs must share a
/// sample rate and channel count.
pub fn concatenate_wav_buffers<B: AsRef<[u8]>>(buffers: &[B]) -> Result<Vec<u8>> {
    let Some(first) = buffers.first() else {
        return Err(WorkerError::Audio("nothing to concatenate".to_string()));
    };
    let reference = decode_pcm16(first.as_ref())?;
    let (sample_rate, channels) = (reference.sample_rate, reference.channels);

    let mut samples = reference.samples;
    for (index, buffer) in buffers.iter().enumerate().skip(1) {
        let wav = decode_pcm16(buffer.as_ref())?;
        if wav.sample_rate != sample_rate || wav.channels != channels {
            return Err(WorkerError::Audio(format!(
                "buffer {} is {} Hz/{} ch, expected {} Hz/{} ch",
                index, wav.sample_rate, wav.channels, sample_rate, channels
            )));
        }
        samples.extend_from_slice(&wav.samples);
    }

    encode_pcm16(sample_rate, channels, &samples)
}

/// A 16-bit PCM WAV of silence
pub fn silence(sample_rate: u32, channels: u16, duration: Duration) -> Result<Vec<u8>> {
    check_layout(channels, sample_rate)?;
    let frames = (f64::from(sample_rate) * duration.as_secs_f64()).round() as usize;
    let samples = vec![0i16; frames.saturating_mul(usize::from(channels))];
    encode_pcm16(sample_rate, channels, &samples)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built header so layouts hound refuses to write can be exercised
    fn raw_wav(format_code: u16, channels: u16, sample_rate: u32, bits: u16, data: &[u8]) -> Vec<u8> {
        let block_align = channels.wrapping_mul(bits / 8);
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&format_code.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&sample_rate.wrapping_mul(u32::from(block_align)).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn float_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        raw_wav(FORMAT_IEEE_FLOAT, 1, sample_rate, 32, &data)
    }

    fn samples_of(wav: &[u8]) -> Vec<i16> {
        decode_pcm16(wav).unwrap().samples
    }

    #[test]
    fn float_samples_scale_and_clamp() {
        assert_eq!(float_to_pcm16(1.0), 32767);
        assert_eq!(float_to_pcm16(-1.0), -32768);
        assert_eq!(float_to_pcm16(1.5), 32767);
        assert_eq!(float_to_pcm16(-7.0), -32768);
        assert_eq!(float_to_pcm16(0.0), 0);
        assert_eq!(float_to_pcm16(f64::NAN), 0);
    }

    #[test]
    fn float_wav_converts_to_pcm16() {
        let wav = float_wav(&[1.0, -1.0, 1.5, 0.5], 24000);
        let pcm = convert_float_wav_to_pcm(&wav).unwrap();

        assert_eq!(pcm.len(), WAV_HEADER_LEN + 8);
        let parsed = parse_wav(&pcm).unwrap();
        assert!(parsed.format.is_pcm16());
        assert_eq!(parsed.format.sample_rate, 24000);
        assert_eq!(samples_of(&pcm), vec![32767, -32768, 32767, 16384]);
    }

    #[test]
    fn unknown_chunks_and_odd_padding_are_skipped() {
        let pcm = encode_pcm16(16000, 1, &[1, 2]).unwrap();
        let mut with_list = Vec::new();
        with_list.extend_from_slice(&pcm[..12]);
        with_list.extend_from_slice(b"LIST");
        with_list.extend_from_slice(&3u32.to_le_bytes());
        with_list.extend_from_slice(&[b'a', b'b', b'c', 0]);
        with_list.extend_from_slice(&pcm[12..]);

        assert_eq!(parse_wav(&with_list).unwrap().data, &[1, 0, 2, 0]);
        assert_eq!(samples_of(&with_list), vec![1, 2]);
    }

    #[test]
    fn streaming_data_size_reads_to_end() {
        let mut wav = encode_pcm16(8000, 1, &[5, 6, 7]).unwrap();
        wav[40..44].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(parse_wav(&wav).unwrap().data.len(), 6);
        assert_eq!(samples_of(&wav), vec![5, 6, 7]);
    }

    #[test]
    fn sixty_four_bit_float_is_decoded_by_the_walker() {
        let data: Vec<u8> = [0.5f64, -2.0].iter().flat_map(|s| s.to_le_bytes()).collect();
        let wav = raw_wav(FORMAT_IEEE_FLOAT, 1, 24000, 64, &data);
        assert_eq!(samples_of(&wav), vec![16384, -32768]);
    }

    #[test]
    fn concatenation_sums_payloads_under_one_header() {
        let a = encode_pcm16(22050, 1, &[1, 2, 3]).unwrap();
        let b = encode_pcm16(22050, 1, &[4, 5]).unwrap();
        let joined = concatenate_wav_buffers(&[a, b]).unwrap();

        assert_eq!(joined.len(), WAV_HEADER_LEN + 10);
        assert_eq!(read_u32(&joined, 40), 10);
        assert_eq!(read_u32(&joined, 4), 36 + 10);
        assert_eq!(samples_of(&joined), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn concatenation_normalizes_float_inputs() {
        let a = float_wav(&[1.0], 24000);
        let b = encode_pcm16(24000, 1, &[16]).unwrap();
        let joined = concatenate_wav_buffers(&[a, b]).unwrap();
        assert_eq!(samples_of(&joined), vec![32767, 16]);
    }

    #[test]
    fn mismatched_sample_rates_are_rejected() {
        let a = encode_pcm16(24000, 1, &[0]).unwrap();
        let b = encode_pcm16(44100, 1, &[0]).unwrap();
        assert!(concatenate_wav_buffers(&[a, b]).is_err());
    }

    #[test]
    fn absurd_layouts_are_errors_not_panics() {
        let huge_rate = raw_wav(FORMAT_PCM, 2, 0x8000_0000, 16, &[0, 0, 0, 0]);
        assert!(matches!(
            concatenate_wav_buffers(&[huge_rate]),
            Err(WorkerError::Audio(_))
        ));

        let many_channels = raw_wav(FORMAT_PCM, 0x4000, 24000, 16, &[0, 0]);
        assert!(decode_pcm16(&many_channels).is_err());
        assert!(silence(u32::MAX, 1, Duration::from_secs(1)).is_err());
        assert!(encode_pcm16(24000, 0, &[]).is_err());
    }

    #[test]
    fn garbage_is_not_a_wav() {
        assert!(parse_wav(b"ID3\x03hello world").is_err());
        assert!(decode_pcm16(b"ID3\x03hello world").is_err());
        assert!(concatenate_wav_buffers::<Vec<u8>>(&[]).is_err());
    }

    #[test]
    fn silence_has_expected_length() {
        let wav = silence(24000, 1, Duration::from_millis(500)).unwrap();
        let parsed = parse_wav(&wav).unwrap();
        assert_eq!(parsed.data.len(), 24000);
        assert!(parsed.data.iter().all(|b| *b == 0));
        assert_eq!(parsed.duration(), Duration::from_millis(500));
    }
}
