/// Audio pipeline tests: WAV conversion, paced/retried synthesis and the
/// audio_generation handler running inside the worker loop.
///
/// Provider audio is produced with `hound` as 32-bit float WAV, the format
/// speech providers commonly return, so the PCM conversion path is exercised.
use async_trait::async_trait;
use reading_worker::artifacts::{ArtifactStore, MemoryArtifactStore};
use reading_worker::audio::wav::float_to_pcm16;
use reading_worker::audio::{
    convert_float_wav_to_pcm, parse_wav, AudioConfig, AudioTaskProcessor, Codec, LoudnessTarget,
    SpeechProvider, SpeechSynthesizer, SynthesisConfig, Transcoder, VoiceParams,
};
use reading_worker::db::{JobStatus, MemoryTaskStore, NewJob, NewTask, TaskStore, TaskType};
use reading_worker::worker::{TaskRunner, WorkerConfig};
use reading_worker::{Result, WorkerError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const SAMPLE_RATE: u32 = 24000;
const FRAMES_PER_CALL: usize = 240;

fn float_wav(samples: &[f32]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut buf = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    buf
}

fn read_pcm16(wav: &[u8]) -> (hound::WavSpec, Vec<i16>) {
    let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    (spec, samples)
}

/// Constant sample level a text is rendered at, so output order is observable
fn level(text: &str) -> f32 {
    (text.len() % 100) as f32 / 100.0
}

/// Speech provider with scripted failures and latency
#[derive(Default)]
struct ScriptedProvider {
    calls: Mutex<Vec<(String, Instant)>>,
    /// HTTP statuses returned for a text before it succeeds
    failures: Mutex<HashMap<String, VecDeque<u16>>>,
    retry_after: Option<Duration>,
    slow_short_texts: bool,
}

impl ScriptedProvider {
    fn fail(self, text: &str, statuses: &[u16]) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(text.to_string(), statuses.iter().copied().collect());
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl SpeechProvider for ScriptedProvider {
    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), Instant::now()));

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(text)
            .and_then(|queue| queue.pop_front());
        if let Some(status) = scripted {
            return Err(WorkerError::from_provider_status(
                status,
                format!("scripted {}", status),
                self.retry_after,
            ));
        }

        if self.slow_short_texts {
            tokio::time::sleep(Duration::from_millis(100 / text.len().max(1) as u64)).await;
        }
        Ok(float_wav(&vec![level(text); FRAMES_PER_CALL]))
    }
}

fn fast_config() -> SynthesisConfig {
    SynthesisConfig {
        inter_chunk_delay: Duration::ZERO,
        chunk_retries: 3,
        retry_base_delay: Duration::from_secs(2),
        retry_max_delay: Duration::from_secs(30),
        concurrency: 1,
        intro_padding: Duration::from_millis(750),
    }
}

fn chunks(texts: &[&str]) -> Vec<String> {
    texts.iter().map(|s| s.to_string()).collect()
}

/// Distinct consecutive sample values, in order
fn levels_in(samples: &[i16]) -> Vec<i16> {
    let mut out: Vec<i16> = Vec::new();
    for &s in samples {
        if out.last() != Some(&s) {
            out.push(s);
        }
    }
    out
}

#[test]
fn test_float_wav_from_hound_converts_to_pcm16() {
    let wav = float_wav(&[0.0, 0.5, -0.5, 1.0, -1.0, 1.5, f32::NAN]);
    let pcm = convert_float_wav_to_pcm(&wav).unwrap();

    let (spec, samples) = read_pcm16(&pcm);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(spec.sample_format, hound::SampleFormat::Int);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(samples, vec![0, 16384, -16384, 32767, -32768, 32767, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_synthesis_keeps_chunk_order() {
    let provider = Arc::new(ScriptedProvider {
        slow_short_texts: true,
        ..Default::default()
    });
    let synthesizer = SpeechSynthesizer::new(
        provider.clone(),
        SynthesisConfig {
            concurrency: 4,
            ..fast_config()
        },
    );
    let texts = ["a", "bb", "ccc", "dddd"];

    let wav = synthesizer
        .synthesize_document(&chunks(&texts), &VoiceParams::default(), None)
        .await
        .unwrap();

    let (spec, samples) = read_pcm16(&wav);
    assert_eq!(spec.channels, 1);
    assert_eq!(samples.len(), texts.len() * FRAMES_PER_CALL);
    let expected: Vec<i16> = texts
        .iter()
        .map(|t| float_to_pcm16(f64::from(level(t))))
        .collect();
    assert_eq!(levels_in(&samples), expected);
}

#[tokio::test(start_paused = true)]
async fn test_provider_calls_are_paced() {
    let provider = Arc::new(ScriptedProvider::default());
    let synthesizer = SpeechSynthesizer::new(
        provider.clone(),
        SynthesisConfig {
            inter_chunk_delay: Duration::from_millis(1500),
            ..fast_config()
        },
    );

    synthesizer
        .synthesize_all(&chunks(&["one", "two", "three"]), &VoiceParams::default())
        .await
        .unwrap();

    let times = provider.call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1500));
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let provider = Arc::new(ScriptedProvider::default().fail("two", &[503, 429]));
    let synthesizer = SpeechSynthesizer::new(provider.clone(), fast_config());

    let buffers = assert_ok!(
        synthesizer
            .synthesize_all(&chunks(&["one", "two", "three"]), &VoiceParams::default())
            .await
    );

    assert_eq!(buffers.len(), 3);
    assert_eq!(provider.calls(), vec!["one", "two", "two", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_overrides_backoff() {
    let provider = Arc::new(ScriptedProvider {
        retry_after: Some(Duration::from_secs(7)),
        ..Default::default()
    }
    .fail("slow down", &[429]));
    let synthesizer = SpeechSynthesizer::new(provider.clone(), fast_config());

    synthesizer
        .synthesize_chunk(0, "slow down", &VoiceParams::default())
        .await
        .unwrap();

    let times = provider.call_times();
    assert_eq!(times.len(), 2);
    let gap = times[1] - times[0];
    assert!(gap >= Duration::from_secs(7) && gap < Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_aborts_without_retry() {
    let provider = Arc::new(ScriptedProvider::default().fail("two", &[401]));
    let synthesizer = SpeechSynthesizer::new(provider.clone(), fast_config());

    let err = assert_err!(
        synthesizer
            .synthesize_all(&chunks(&["one", "two", "three"]), &VoiceParams::default())
            .await
    );

    assert!(matches!(err, WorkerError::ProviderFatal { status: Some(401), .. }));
    assert!(err.is_permanent());
    assert_eq!(provider.calls(), vec!["one", "two"]);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhaust_with_last_error() {
    let provider = Arc::new(ScriptedProvider::default().fail("one", &[500, 502, 503, 504]));
    let synthesizer = SpeechSynthesizer::new(
        provider.clone(),
        SynthesisConfig {
            chunk_retries: 2,
            ..fast_config()
        },
    );

    let err = synthesizer
        .synthesize_chunk(0, "one", &VoiceParams::default())
        .await
        .unwrap_err();

    match err {
        WorkerError::RetryExhausted {
            target,
            attempts,
            last_error,
        } => {
            assert_eq!(target, "chunk 1");
            assert_eq!(attempts, 3);
            assert!(last_error.contains("503"));
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert_eq!(provider.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_intro_is_padded_with_silence() {
    let provider = Arc::new(ScriptedProvider::default());
    let synthesizer = SpeechSynthesizer::new(provider.clone(), fast_config());

    let wav = synthesizer
        .synthesize_document(&chunks(&["body one", "body two"]), &VoiceParams::default(), Some("Welcome"))
        .await
        .unwrap();

    let pad_frames = (SAMPLE_RATE as usize * 750) / 1000;
    let parsed = parse_wav(&wav).unwrap();
    assert!(parsed.format.is_pcm16());
    assert_eq!(parsed.data.len() / 2, 2 * pad_frames + 3 * FRAMES_PER_CALL);
    assert_eq!(provider.calls(), vec!["Welcome", "body one", "body two"]);

    let (_, samples) = read_pcm16(&wav);
    assert!(samples[..pad_frames].iter().all(|&s| s == 0));
    assert_eq!(samples[pad_frames], float_to_pcm16(f64::from(level("Welcome"))));
}

// ----------------------------------------------------------------------------
// audio_generation handler inside the worker loop
// ----------------------------------------------------------------------------

/// Records what it was asked to encode and returns a fake container
#[derive(Default)]
struct FakeTranscoder {
    inputs: Mutex<Vec<(Vec<u8>, Codec)>>,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(&self, wav: &[u8], codec: Codec, _loudness: LoudnessTarget) -> Result<Vec<u8>> {
        self.inputs.lock().unwrap().push((wav.to_vec(), codec));
        Ok(format!("{}:{}", codec.extension(), wav.len()).into_bytes())
    }
}

struct Pipeline {
    store: Arc<MemoryTaskStore>,
    artifacts: Arc<MemoryArtifactStore>,
    provider: Arc<ScriptedProvider>,
    transcoder: Arc<FakeTranscoder>,
    runner: TaskRunner<AudioTaskProcessor>,
    job_id: Uuid,
}

impl Pipeline {
    fn new() -> Self {
        let store = Arc::new(MemoryTaskStore::default());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let provider = Arc::new(ScriptedProvider::default());
        let transcoder = Arc::new(FakeTranscoder::default());
        let processor = AudioTaskProcessor::new(
            provider.clone(),
            transcoder.clone(),
            AudioConfig {
                chunk_max_len: 30,
                synthesis: fast_config(),
                ..AudioConfig::default()
            },
        )
        .unwrap();
        let runner = TaskRunner::new(
            store.clone(),
            artifacts.clone(),
            WorkerConfig::builder().worker_id("audio-worker").build(),
            processor,
        );
        let job_id = store
            .insert_job(NewJob {
                job_type: "reading".to_string(),
                params: json!({}),
            })
            .id;
        Self {
            store,
            artifacts,
            provider,
            transcoder,
            runner,
            job_id,
        }
    }

    async fn enqueue(&self, task_type: TaskType, sequence: i32, input: Value) -> Uuid {
        self.store
            .enqueue(&NewTask {
                job_id: self.job_id,
                task_type,
                sequence,
                input,
                max_attempts: 3,
            })
            .await
            .unwrap()
            .unwrap()
    }

    /// Text task at `sequence`, claimed by a text worker and left processing
    async fn claimed_text_task(&self, sequence: i32) -> Uuid {
        let id = self
            .enqueue(TaskType::TextGeneration, sequence, json!({ "template": "guide" }))
            .await;
        self.store
            .claim("text-worker", 1, &[TaskType::TextGeneration])
            .await
            .unwrap();
        id
    }

    async fn task(&self, id: Uuid) -> reading_worker::db::Task {
        self.store.get_task(id).await.unwrap().unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_inline_text_becomes_one_audio_deliverable() {
    let p = Pipeline::new();
    let task_id = p
        .enqueue(
            TaskType::AudioGeneration,
            0,
            json!({
                "source": { "inline": "First sentence here. Second one follows! And a third?" },
                "deliverable": { "person": "Jane Doe", "system": "Acme CRM", "document": "Intro Guide" }
            }),
        )
        .await;

    assert_eq!(p.runner.run_once().await.unwrap(), 1);

    let task = p.task(task_id).await;
    assert_eq!(task.status, "complete", "error: {:?}", task.error);
    let output = task.output.unwrap();
    assert_eq!(output["chunks"], 3);
    assert_eq!(output["codec"], "mp3");
    assert_eq!(output["artifacts"], json!(["jane-doe/reading/acme-crm-intro-guide.mp3"]));
    assert_eq!(
        p.provider.calls(),
        vec!["First sentence here.", "Second one follows!", "And a third?"]
    );

    // The transcoder sees one 16-bit PCM WAV holding every chunk
    let inputs = p.transcoder.inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 1);
    let (wav, codec) = &inputs[0];
    assert_eq!(*codec, Codec::Mp3);
    let parsed = parse_wav(wav).unwrap();
    assert!(parsed.format.is_pcm16());
    assert_eq!(parsed.data.len() / 2, 3 * FRAMES_PER_CALL);

    let stored = p
        .artifacts
        .get("jane-doe/reading/acme-crm-intro-guide.mp3")
        .await
        .unwrap();
    assert_eq!(stored, format!("mp3:{}", wav.len()).into_bytes());
    let rows = p.store.artifacts();
    assert_eq!(rows[0].artifact_type, "audio");
    assert_eq!(rows[0].content_type, "audio/mpeg");
    assert_eq!(rows[0].metadata["chunks"], 3);

    let job = p.store.get_job(p.job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Complete));
}

#[tokio::test(start_paused = true)]
async fn test_text_from_completed_sibling_task() {
    let p = Pipeline::new();
    let text_id = p.claimed_text_task(0).await;
    p.store
        .complete(text_id, "text-worker", &json!({ "text": "Generated narration text." }))
        .await
        .unwrap();
    let audio_id = p
        .enqueue(TaskType::AudioGeneration, 1, json!({ "source": { "sibling_sequence": 0 }, "codec": "opus" }))
        .await;

    p.runner.run_once().await.unwrap();

    let task = p.task(audio_id).await;
    assert_eq!(task.status, "complete", "error: {:?}", task.error);
    assert_eq!(p.provider.calls(), vec!["Generated narration text."]);
    let path = format!("jobs/{}/tasks/{}/audio.ogg", p.job_id, audio_id);
    assert_eq!(p.artifacts.paths(), vec![path.clone()]);
    assert_eq!(p.artifacts.content_type(&path).as_deref(), Some("audio/ogg"));
}

#[tokio::test(start_paused = true)]
async fn test_sibling_still_running_defers_audio_task() {
    let p = Pipeline::new();
    p.claimed_text_task(0).await;
    let audio_id = p
        .enqueue(TaskType::AudioGeneration, 1, json!({ "source": { "sibling_sequence": 0 } }))
        .await;

    p.runner.run_once().await.unwrap();

    let task = p.task(audio_id).await;
    assert_eq!(task.status, "pending");
    assert_eq!(task.attempts, 0);
    assert!(task.available_at.is_some());
    assert!(task.error.unwrap().starts_with("Dependency not ready"));
    assert!(p.provider.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_sibling_fails_audio_task_permanently() {
    let p = Pipeline::new();
    let text_id = p.claimed_text_task(0).await;
    p.store
        .fail_permanently(text_id, "text-worker", "template missing")
        .await
        .unwrap();
    let audio_id = p
        .enqueue(TaskType::AudioGeneration, 1, json!({ "source": { "sibling_sequence": 0 } }))
        .await;

    p.runner.run_once().await.unwrap();

    let task = p.task(audio_id).await;
    assert_eq!(task.status, "failed");
    assert_eq!(task.attempts, 3);

    let job = p.store.get_job(p.job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), Some(JobStatus::Error));
    assert_eq!(job.error.as_deref(), Some("template missing"));
}

#[tokio::test(start_paused = true)]
async fn test_text_read_from_stored_artifact() {
    let p = Pipeline::new();
    p.artifacts
        .insert("inputs/letter.txt", b"Dear reader. Thanks for listening.".to_vec(), "text/plain");
    let present = p
        .enqueue(TaskType::AudioGeneration, 0, json!({ "source": { "artifact_path": "inputs/letter.txt" } }))
        .await;
    let missing = p
        .enqueue(TaskType::AudioGeneration, 1, json!({ "source": { "artifact_path": "inputs/nope.txt" } }))
        .await;

    p.runner.run_once().await.unwrap();

    assert_eq!(p.task(present).await.status, "complete");
    assert_eq!(p.provider.calls(), vec!["Dear reader.", "Thanks for listening."]);

    let missing = p.task(missing).await;
    assert_eq!(missing.status, "pending");
    assert_eq!(missing.attempts, 0);
    assert!(missing.error.unwrap().contains("inputs/nope.txt"));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_provider_error_fails_audio_task() {
    let p = Pipeline::new();
    let provider = Arc::new(ScriptedProvider::default().fail("Unauthorized text.", &[403]));
    let processor = AudioTaskProcessor::new(
        provider.clone(),
        Arc::new(FakeTranscoder::default()),
        AudioConfig {
            synthesis: fast_config(),
            ..AudioConfig::default()
        },
    )
    .unwrap();
    let runner = TaskRunner::new(
        p.store.clone(),
        p.artifacts.clone(),
        WorkerConfig::builder().worker_id("w2").build(),
        processor,
    );
    let task_id = p
        .enqueue(TaskType::AudioGeneration, 0, json!({ "source": { "inline": "Unauthorized text." } }))
        .await;

    runner.run_once().await.unwrap();

    let task = p.task(task_id).await;
    assert_eq!(task.status, "failed");
    assert_eq!(task.attempts, 3);
    assert_eq!(provider.calls().len(), 1);
    assert!(p.artifacts.paths().is_empty());
}
