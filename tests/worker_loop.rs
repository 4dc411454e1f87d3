/// Worker loop tests: claim, process, persist, and the resulting task/job state
///
/// Handlers here are scripted so the loop's own behavior is what's under test.
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reading_worker::artifacts::{ArtifactStore, MemoryArtifactStore};
use reading_worker::clock::ManualClock;
use reading_worker::db::{
    ArtifactType, JobStatus, MemoryTaskStore, NewJob, NewTask, Task, TaskStore, TaskType,
};
use reading_worker::notify::LogNotifier;
use reading_worker::worker::{
    ClaimedTask, NewArtifact, TaskContext, TaskHandler, TaskOutcome, TaskRunner, WorkerConfig,
};
use reading_worker::{Result, Watchdog, WatchdogConfig, WorkerError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

type Behavior = dyn Fn(&ClaimedTask) -> Result<TaskOutcome> + Send + Sync;

/// Records every task it sees and answers with a scripted outcome
struct ScriptedHandler {
    seen: Arc<Mutex<Vec<Uuid>>>,
    delay: Option<Duration>,
    behavior: Box<Behavior>,
}

impl ScriptedHandler {
    fn new(behavior: impl Fn(&ClaimedTask) -> Result<TaskOutcome> + Send + Sync + 'static) -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            behavior: Box::new(behavior),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn seen(&self) -> Arc<Mutex<Vec<Uuid>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn task_types(&self) -> Vec<TaskType> {
        vec![TaskType::AudioGeneration]
    }

    async fn process(&self, _ctx: &TaskContext, task: &ClaimedTask) -> Result<TaskOutcome> {
        self.seen.lock().unwrap().push(task.task.id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.behavior)(task)
    }
}

fn audio_outcome(_task: &ClaimedTask) -> Result<TaskOutcome> {
    Ok(TaskOutcome::new(json!({ "chunks": 2 })).with_artifact(NewArtifact {
        artifact_type: ArtifactType::Audio,
        bytes: b"fake mp3 bytes".to_vec(),
        content_type: "audio/mpeg".to_string(),
        extension: "mp3".to_string(),
        metadata: json!({ "duration_seconds": 1.5 }),
        friendly_path: None,
    }))
}

fn config(worker_id: &str) -> WorkerConfig {
    WorkerConfig::builder()
        .worker_id(worker_id)
        .max_concurrent_tasks(2)
        .poll_interval(Duration::from_millis(10))
        .max_poll_interval(Duration::from_millis(40))
        .heartbeat_interval(Duration::from_secs(60))
        .task_timeout(Duration::from_secs(5))
        .build()
}

struct Fixture {
    store: Arc<MemoryTaskStore>,
    artifacts: Arc<MemoryArtifactStore>,
    job_id: Uuid,
}

impl Fixture {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryTaskStore::default()))
    }

    fn with_store(store: Arc<MemoryTaskStore>) -> Self {
        let job_id = store
            .insert_job(NewJob {
                job_type: "reading".to_string(),
                params: json!({}),
            })
            .id;
        Self {
            store,
            artifacts: Arc::new(MemoryArtifactStore::new()),
            job_id,
        }
    }

    async fn enqueue(&self, sequence: i32, input: serde_json::Value) -> Uuid {
        self.store
            .enqueue(&NewTask {
                job_id: self.job_id,
                task_type: TaskType::AudioGeneration,
                sequence,
                input,
                max_attempts: 3,
            })
            .await
            .unwrap()
            .unwrap()
    }

    async fn enqueue_audio(&self, sequence: i32) -> Uuid {
        self.enqueue(sequence, json!({ "source": { "inline": "Some text." } }))
            .await
    }

    fn runner<H: TaskHandler + 'static>(&self, worker_id: &str, handler: H) -> TaskRunner<H> {
        TaskRunner::new(
            self.store.clone(),
            self.artifacts.clone(),
            config(worker_id),
            handler,
        )
    }

    fn runner_with<H: TaskHandler + 'static>(&self, config: WorkerConfig, handler: H) -> TaskRunner<H> {
        TaskRunner::new(self.store.clone(), self.artifacts.clone(), config, handler)
    }

    async fn task(&self, id: Uuid) -> Task {
        self.store.get_task(id).await.unwrap().unwrap()
    }

    async fn job(&self) -> reading_worker::db::Job {
        self.store.get_job(self.job_id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_completed_task_stores_artifact_and_completes_job() {
    let fx = Fixture::new();
    let task_id = fx.enqueue_audio(0).await;
    let runner = fx.runner("w1", ScriptedHandler::new(audio_outcome));

    assert_eq!(runner.run_once().await.unwrap(), 1);

    let expected_path = format!("jobs/{}/tasks/{}/audio.mp3", fx.job_id, task_id);
    let task = fx.task(task_id).await;
    assert_eq!(task.status, "complete");
    assert!(task.worker_id.is_none());
    let output = task.output.unwrap();
    assert_eq!(output["chunks"], 2);
    assert_eq!(output["artifacts"], json!([expected_path]));

    assert_eq!(fx.artifacts.get(&expected_path).await.unwrap(), b"fake mp3 bytes");
    assert_eq!(fx.artifacts.content_type(&expected_path).as_deref(), Some("audio/mpeg"));

    let rows = fx.store.artifacts();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].storage_path, expected_path);
    assert_eq!(rows[0].size_bytes, 14);
    assert_eq!(rows[0].metadata["duration_seconds"], 1.5);
    assert_eq!(
        rows[0].metadata["sha256"].as_str().map(str::len),
        Some(64),
        "content hash is recorded"
    );

    let job = fx.job().await;
    assert_eq!(job.status(), Some(JobStatus::Complete));
    assert_eq!(job.progress().percent, 100);
}

#[tokio::test]
async fn test_friendly_path_is_used_for_deliverables() {
    let fx = Fixture::new();
    fx.enqueue_audio(0).await;
    let runner = fx.runner(
        "w1",
        ScriptedHandler::new(|task| {
            let mut outcome = audio_outcome(task)?;
            outcome.artifacts[0].friendly_path = Some("jane-doe/reading/sys-doc.mp3".to_string());
            Ok(outcome)
        }),
    );

    runner.run_once().await.unwrap();
    assert_eq!(fx.artifacts.paths(), vec!["jane-doe/reading/sys-doc.mp3".to_string()]);
}

#[tokio::test]
async fn test_invalid_input_fails_permanently_without_reaching_handler() {
    let fx = Fixture::new();
    let task_id = fx.enqueue(0, json!({ "voice": { "voice": "nova" } })).await;
    let handler = ScriptedHandler::new(audio_outcome);
    let seen = handler.seen();
    let runner = fx.runner("w1", handler);

    assert_eq!(runner.run_once().await.unwrap(), 1);

    assert!(seen.lock().unwrap().is_empty());
    let task = fx.task(task_id).await;
    assert_eq!(task.status, "failed");
    assert_eq!(task.attempts, task.max_attempts);
    assert!(task.error.unwrap().starts_with("Invalid task input"));

    let job = fx.job().await;
    assert_eq!(job.status(), Some(JobStatus::Error));
    assert!(job.error.is_some());
}

#[tokio::test]
async fn test_retryable_handler_error_requeues_task() {
    let fx = Fixture::new();
    let task_id = fx.enqueue_audio(0).await;
    let runner = fx.runner(
        "w1",
        ScriptedHandler::new(|_| {
            Err(WorkerError::RetryExhausted {
                target: "chunk 1".to_string(),
                attempts: 4,
                last_error: "HTTP 503".to_string(),
            })
        }),
    );

    runner.run_once().await.unwrap();

    let task = fx.task(task_id).await;
    assert_eq!(task.status, "pending");
    assert_eq!(task.attempts, 1);
    assert!(task.worker_id.is_none());
    assert!(task.error.unwrap().contains("chunk 1"));
    assert_eq!(fx.job().await.status(), Some(JobStatus::Processing));
}

#[tokio::test]
async fn test_fatal_provider_error_fails_task_immediately() {
    let fx = Fixture::new();
    let task_id = fx.enqueue_audio(0).await;
    let runner = fx.runner(
        "w1",
        ScriptedHandler::new(|_| {
            Err(WorkerError::ProviderFatal {
                status: Some(401),
                message: "invalid api key".to_string(),
            })
        }),
    );

    runner.run_once().await.unwrap();

    let task = fx.task(task_id).await;
    assert_eq!(task.status, "failed");
    assert_eq!(task.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_counts_as_a_failed_attempt() {
    let fx = Fixture::new();
    let task_id = fx.enqueue_audio(0).await;
    let handler = ScriptedHandler::new(audio_outcome).with_delay(Duration::from_secs(60));
    let runner = TaskRunner::new(
        fx.store.clone(),
        fx.artifacts.clone(),
        WorkerConfig::builder()
            .worker_id("w1")
            .task_timeout(Duration::from_secs(1))
            .build(),
        handler,
    );

    runner.run_once().await.unwrap();

    let task = fx.task(task_id).await;
    assert_eq!(task.status, "pending");
    assert_eq!(task.attempts, 1);
    assert_eq!(task.error.as_deref(), Some("Task timeout"));
    assert!(fx.artifacts.paths().is_empty());
}

#[tokio::test]
async fn test_follow_ups_are_enqueued_before_completion() {
    let fx = Fixture::new();
    fx.enqueue_audio(0).await;
    let job_id = fx.job_id;
    let runner = fx.runner(
        "w1",
        ScriptedHandler::new(move |_| {
            Ok(TaskOutcome::new(json!({})).with_follow_up(NewTask {
                job_id,
                task_type: TaskType::PdfGeneration,
                sequence: 1,
                input: json!({ "source_sequences": [0] }),
                max_attempts: 3,
            }))
        }),
    );

    runner.run_once().await.unwrap();

    let tasks = fx.store.list_job_tasks(fx.job_id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].task_type, "pdf_generation");
    assert_eq!(tasks[1].status, "pending");

    let job = fx.job().await;
    assert_eq!(job.status(), Some(JobStatus::Processing));
    assert_eq!(job.progress().percent, 50);
}

/// Lets the lease expire mid-task and hands the task to another worker
struct LeaseThief {
    clock: ManualClock,
}

#[async_trait]
impl TaskHandler for LeaseThief {
    fn task_types(&self) -> Vec<TaskType> {
        vec![TaskType::AudioGeneration]
    }

    async fn process(&self, ctx: &TaskContext, _task: &ClaimedTask) -> Result<TaskOutcome> {
        self.clock.advance(ChronoDuration::minutes(10));
        ctx.store.reclaim_stale(Duration::from_secs(300)).await?;
        ctx.store
            .claim("thief", 1, &[TaskType::AudioGeneration])
            .await?;
        Ok(TaskOutcome::new(json!({ "from": "original owner" })))
    }
}

#[tokio::test]
async fn test_completion_after_lost_lease_is_discarded() {
    let clock = ManualClock::default();
    let fx = Fixture::with_store(Arc::new(MemoryTaskStore::new(Arc::new(clock.clone()))));
    let task_id = fx.enqueue_audio(0).await;
    let runner = fx.runner("w1", LeaseThief { clock });

    runner.run_once().await.unwrap();

    let task = fx.task(task_id).await;
    assert_eq!(task.status, "processing");
    assert_eq!(task.worker_id.as_deref(), Some("thief"));
    assert!(task.output.is_none());
}

#[tokio::test]
async fn test_only_handler_task_types_are_claimed() {
    let fx = Fixture::new();
    fx.store
        .enqueue(&NewTask {
            job_id: fx.job_id,
            task_type: TaskType::TextGeneration,
            sequence: 0,
            input: json!({ "template": "summary" }),
            max_attempts: 3,
        })
        .await
        .unwrap();
    let runner = fx.runner("w1", ScriptedHandler::new(audio_outcome));

    assert_eq!(runner.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_two_workers_process_each_task_once() {
    let fx = Fixture::new();
    for seq in 0..6 {
        fx.enqueue_audio(seq).await;
    }

    let first = ScriptedHandler::new(audio_outcome);
    let second = ScriptedHandler::new(audio_outcome);
    let (seen_a, seen_b) = (first.seen(), second.seen());
    let a = fx.runner("a", first);
    let b = fx.runner("b", second);

    loop {
        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        if ra.unwrap() + rb.unwrap() == 0 {
            break;
        }
    }

    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for id in seen_a.lock().unwrap().iter().chain(seen_b.lock().unwrap().iter()) {
        *counts.entry(*id).or_default() += 1;
    }
    assert_eq!(counts.len(), 6);
    assert!(counts.values().all(|&n| n == 1));
    assert_eq!(fx.job().await.status(), Some(JobStatus::Complete));
}

#[tokio::test]
async fn test_background_loop_drains_queue_and_stops() {
    let fx = Fixture::new();
    let ids = [fx.enqueue_audio(0).await, fx.enqueue_audio(1).await, fx.enqueue_audio(2).await];
    let runner = Arc::new(fx.runner("w1", ScriptedHandler::new(audio_outcome)));
    let handle = Arc::clone(&runner).start();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut done = 0;
            for id in ids {
                if fx.task(id).await.status == "complete" {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue drained");

    runner.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop exits after stop")
        .unwrap()
        .unwrap();
}

fn unavailable_voice(_task: &ClaimedTask) -> Result<TaskOutcome> {
    Err(WorkerError::RetryExhausted {
        target: "chunk 3".to_string(),
        attempts: 4,
        last_error: "HTTP 503".to_string(),
    })
}

#[tokio::test]
async fn test_exhausted_task_fails_job_with_its_error() {
    let fx = Fixture::new();
    let ids = [fx.enqueue_audio(0).await, fx.enqueue_audio(1).await, fx.enqueue_audio(2).await];
    let runner = fx.runner(
        "w1",
        ScriptedHandler::new(|task| {
            if task.task.sequence == 1 {
                unavailable_voice(task)
            } else {
                audio_outcome(task)
            }
        }),
    );

    for _ in 0..10 {
        if runner.run_once().await.unwrap() == 0 {
            break;
        }
    }

    let failed = fx.task(ids[1]).await;
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.attempts, failed.max_attempts);
    assert_eq!(fx.task(ids[0]).await.status, "complete");
    assert_eq!(fx.task(ids[2]).await.status, "complete");

    let job = fx.job().await;
    assert_eq!(job.status(), Some(JobStatus::Error));
    assert_eq!(job.progress().percent, 67);
    assert_eq!(job.error, failed.error);
    assert!(job.error.unwrap().contains("HTTP 503"));
}

#[tokio::test]
async fn test_handler_panic_is_a_failed_attempt_and_spares_siblings() {
    let fx = Fixture::new();
    let doomed = fx.enqueue_audio(0).await;
    let sibling = fx.enqueue_audio(1).await;
    let runner = fx.runner(
        "w1",
        ScriptedHandler::new(|task| {
            if task.task.sequence == 0 {
                panic!("voice table corrupted");
            }
            audio_outcome(task)
        }),
    );

    assert_eq!(runner.run_once().await.unwrap(), 2);

    let task = fx.task(doomed).await;
    assert_eq!(task.status, "pending");
    assert_eq!(task.attempts, 1);
    assert!(task.worker_id.is_none());
    let error = task.error.unwrap();
    assert!(error.contains("panicked"), "unexpected error: {error}");
    assert!(error.contains("voice table corrupted"));

    assert_eq!(fx.task(sibling).await.status, "complete");
    assert_eq!(fx.job().await.status(), Some(JobStatus::Processing));
}

#[tokio::test]
async fn test_unready_dependency_defers_without_spending_attempts() {
    let clock = ManualClock::default();
    let fx = Fixture::with_store(Arc::new(MemoryTaskStore::new(Arc::new(clock.clone()))));
    let task_id = fx.enqueue_audio(0).await;
    let handler = ScriptedHandler::new(|_| {
        Err(WorkerError::DependencyNotReady("sibling 0 still processing".to_string()))
    });
    let seen = handler.seen();
    let runner = fx.runner("w1", handler);

    assert_eq!(runner.run_once().await.unwrap(), 1);

    let task = fx.task(task_id).await;
    assert_eq!(task.status, "pending");
    assert_eq!(task.attempts, 0);
    assert!(task.worker_id.is_none());
    assert!(task.available_at.is_some());
    assert!(task.error.unwrap().contains("sibling 0 still processing"));

    // Not claimable until the retry delay passes
    assert_eq!(runner.run_once().await.unwrap(), 0);
    clock.advance(ChronoDuration::seconds(31));
    assert_eq!(runner.run_once().await.unwrap(), 1);

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(fx.task(task_id).await.attempts, 0);
}

/// Runs across several heartbeat intervals, then sweeps for stale leases
struct LongRunningHandler {
    clock: ManualClock,
    watchdog: Watchdog,
}

#[async_trait]
impl TaskHandler for LongRunningHandler {
    fn task_types(&self) -> Vec<TaskType> {
        vec![TaskType::AudioGeneration]
    }

    async fn process(&self, _ctx: &TaskContext, _task: &ClaimedTask) -> Result<TaskOutcome> {
        for _ in 0..6 {
            self.clock.advance(ChronoDuration::seconds(60));
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        let report = self.watchdog.sweep().await?;
        Ok(TaskOutcome::new(json!({ "reclaimed_mid_task": report.reclaimed })))
    }
}

#[tokio::test(start_paused = true)]
async fn test_long_task_keeps_its_lease_through_a_sweep() {
    let clock = ManualClock::default();
    let fx = Fixture::with_store(Arc::new(MemoryTaskStore::new(Arc::new(clock.clone()))));
    let task_id = fx.enqueue_audio(0).await;
    let heartbeat = Duration::from_secs(60);
    let watchdog = Watchdog::new(
        fx.store.clone(),
        Arc::new(LogNotifier),
        WatchdogConfig::default().with_heartbeat(heartbeat, 5),
    );
    let runner = fx.runner_with(
        WorkerConfig::builder()
            .worker_id("w1")
            .heartbeat_interval(heartbeat)
            .task_timeout(Duration::from_secs(3600))
            .build(),
        LongRunningHandler { clock, watchdog },
    );

    assert_eq!(runner.run_once().await.unwrap(), 1);

    let task = fx.task(task_id).await;
    assert_eq!(task.status, "complete");
    assert_eq!(task.attempts, 0);
    assert_eq!(task.output.unwrap()["reclaimed_mid_task"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_loop_backs_off_up_to_the_cap_and_resets_on_work() {
    let fx = Fixture::new();
    let picked_up = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&picked_up);
    let runner = Arc::new(fx.runner(
        "w1",
        ScriptedHandler::new(move |task| {
            recorder.lock().unwrap().push(Instant::now());
            audio_outcome(task)
        }),
    ));

    // Empty claims at 0, 10, 30, 70 and 110 ms: 10, 20, 40, then capped at 40
    let start = Instant::now();
    let handle = Arc::clone(&runner).start();

    sleep_until(start + Duration::from_millis(75)).await;
    fx.enqueue_audio(0).await;
    sleep_until(start + Duration::from_millis(111)).await;
    {
        let picked = picked_up.lock().unwrap();
        assert_eq!(picked.len(), 1, "picked up on the capped poll");
        assert!(picked[0] - start >= Duration::from_millis(110));
    }

    // Work reset the backoff, so the next empty poll waits only the base interval
    fx.enqueue_audio(1).await;
    sleep_until(start + Duration::from_millis(149)).await;
    {
        let picked = picked_up.lock().unwrap();
        assert_eq!(picked.len(), 2);
        assert!(picked[1] - start <= Duration::from_millis(121));
    }

    runner.stop();
    handle.await.unwrap().unwrap();
    assert_eq!(fx.job().await.status(), Some(JobStatus::Complete));
}
