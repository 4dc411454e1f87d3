//! Reading Worker CLI
//!
//! Runs the audio worker and the watchdog, plus maintenance commands for the
//! task queue.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reading_worker::artifacts::{
    ArtifactStore, HttpArtifactStore, HttpStorageConfig, LocalArtifactStore, MemoryArtifactStore,
};
use reading_worker::audio::{
    split_into_chunks, AudioConfig, AudioTaskProcessor, FfmpegTranscoder, HttpSpeechConfig,
    HttpSpeechProvider, SynthesisConfig,
};
use reading_worker::db::{
    create_pool, run_migrations, MemoryTaskStore, NewJob, NewTask, PgTaskStore, TaskStore,
    TaskType,
};
use reading_worker::notify::{JobNotifier, LogNotifier, WebhookNotifier};
use reading_worker::watchdog::DEFAULT_STALE_MULTIPLIER;
use reading_worker::worker::{setup_signal_handler, sync_job_status, TaskRunner, WorkerConfig};
use reading_worker::{Watchdog, WatchdogConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "reading-worker")]
#[command(about = "Durable task-queue worker for narrated audio generation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Max pooled database connections
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "5", global = true)]
    max_connections: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the audio worker, claiming audio_generation tasks
    Worker(WorkerArgs),

    /// Run the watchdog: reclaim stale leases, fail stuck jobs, send notifications
    Watchdog(WatchdogArgs),

    /// Recompute a job's status from its tasks
    SyncJob {
        /// Job id
        job_id: Uuid,
    },

    /// Reclaim stale processing tasks once
    Reclaim {
        /// Seconds without a heartbeat before a lease is stale
        #[arg(long, default_value = "300")]
        stale_secs: u64,
    },

    /// Show task counts by status
    Stats,

    /// Preview how a text file would be chunked for synthesis
    Chunk {
        /// Text file to split
        file: PathBuf,

        /// Max chars per chunk
        #[arg(long, default_value = "300")]
        max_len: usize,
    },

    /// Apply database migrations
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum StorageKind {
    /// Files under --artifact-dir
    Local,
    /// Supabase Storage (SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY)
    Supabase,
}

#[derive(Args)]
struct WorkerArgs {
    /// Run one claim/process iteration and exit
    #[arg(long)]
    once: bool,

    /// Use in-memory task and artifact stores (no database)
    #[arg(long)]
    memory: bool,

    /// With --memory: seed a job narrating this text file
    #[arg(long, requires = "memory")]
    seed_text: Option<PathBuf>,

    /// Lease owner id (defaults to host-pid-random)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Max tasks claimed and processed per iteration
    #[arg(long, env = "WORKER_CONCURRENCY", default_value = "2")]
    concurrency: usize,

    /// Base idle poll interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "5000")]
    poll_interval_ms: u64,

    /// Idle poll interval ceiling in milliseconds
    #[arg(long, env = "MAX_POLL_INTERVAL_MS", default_value = "30000")]
    max_poll_interval_ms: u64,

    /// Heartbeat interval in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "60")]
    heartbeat_secs: u64,

    /// Task timeout in seconds
    #[arg(short, long, env = "TASK_TIMEOUT_SECS", default_value = "1800")]
    timeout: u64,

    /// With --seed-text: retry budget of the seeded task
    #[arg(long, requires = "seed_text", default_value = "3")]
    seed_max_attempts: i32,

    /// Seconds a task waiting on an unfinished sibling stays unclaimable
    #[arg(long, env = "DEPENDENCY_RETRY_SECS", default_value = "30")]
    dependency_retry_secs: u64,

    /// Max chars per synthesis call
    #[arg(long, env = "CHUNK_MAX_LEN", default_value = "300")]
    chunk_max_len: usize,

    /// Minimum delay between synthesis calls in milliseconds
    #[arg(long, env = "INTER_CHUNK_DELAY_MS", default_value = "1500")]
    inter_chunk_delay_ms: u64,

    /// Retries per chunk for transient provider errors
    #[arg(long, env = "CHUNK_RETRIES", default_value = "3")]
    chunk_retries: u32,

    /// Chunks synthesized concurrently (1 = sequential)
    #[arg(long, env = "SYNTHESIS_CONCURRENCY", default_value = "1")]
    synthesis_concurrency: usize,

    /// Where artifact bytes are stored
    #[arg(long, env = "ARTIFACT_STORAGE", value_enum, default_value = "local")]
    storage: StorageKind,

    /// Root directory for local artifact storage
    #[arg(long, env = "ARTIFACT_DIR", default_value = "./artifacts")]
    artifact_dir: PathBuf,

    /// Path to ffmpeg (searched on PATH if omitted)
    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg: Option<PathBuf>,
}

#[derive(Args)]
struct WatchdogArgs {
    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,

    /// Seconds between sweeps
    #[arg(long, env = "WATCHDOG_INTERVAL_SECS", default_value = "60")]
    interval_secs: u64,

    /// Worker heartbeat interval in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "60")]
    heartbeat_secs: u64,

    /// Missed heartbeats before a lease is reclaimed
    #[arg(long, env = "STALE_MULTIPLIER", default_value_t = DEFAULT_STALE_MULTIPLIER)]
    stale_multiplier: u32,

    /// Minutes a job may stay queued with no task activity
    #[arg(long, env = "QUEUED_CEILING_MINS", default_value = "30")]
    queued_ceiling_mins: u64,

    /// Webhook notified when a job completes
    #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Shared secret sent with webhook notifications
    #[arg(long, env = "NOTIFY_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Worker(ref args) => run_worker(&cli, args).await?,

        Commands::Watchdog(ref args) => {
            let store = pg_store(&cli).await?;
            let notifier: Arc<dyn JobNotifier> = match &args.webhook_url {
                Some(url) => Arc::new(WebhookNotifier::new(url, args.webhook_secret.clone())?),
                None => Arc::new(LogNotifier),
            };
            let config = WatchdogConfig {
                interval: Duration::from_secs(args.interval_secs),
                queued_ceiling: Duration::from_secs(args.queued_ceiling_mins * 60),
                ..WatchdogConfig::default()
            }
            .with_heartbeat(Duration::from_secs(args.heartbeat_secs), args.stale_multiplier);
            let watchdog = Watchdog::new(store, notifier, config);

            if args.once {
                let report = watchdog.sweep().await?;
                println!(
                    "Reclaimed {} task(s), failed {} stuck job(s), sent {} notification(s) ({} failed)",
                    report.reclaimed, report.stuck_failed, report.notified, report.notify_failed
                );
            } else {
                setup_signal_handler(watchdog.shutdown_handle());
                watchdog.run().await?;
            }
        }

        Commands::SyncJob { job_id } => {
            let store = pg_store(&cli).await?;
            match sync_job_status(store.as_ref(), job_id).await? {
                Some(rollup) => println!(
                    "Job {}: {} ({}%){}",
                    job_id,
                    rollup.status.as_str(),
                    rollup.progress.percent,
                    rollup
                        .error
                        .map(|e| format!(" - {}", e))
                        .unwrap_or_default()
                ),
                None => println!("Job {} has no tasks", job_id),
            }
        }

        Commands::Reclaim { stale_secs } => {
            let store = pg_store(&cli).await?;
            let reclaimed = store.reclaim_stale(Duration::from_secs(stale_secs)).await?;
            println!("Reclaimed {} stale task(s)", reclaimed);
        }

        Commands::Stats => {
            let store = pg_store(&cli).await?;
            for (status, count) in store.count_tasks_by_status().await? {
                println!("{:>12}  {}", status, count);
            }
        }

        Commands::Chunk { ref file, max_len } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let chunks = split_into_chunks(&text, max_len)?;
            for (i, chunk) in chunks.iter().enumerate() {
                println!("[{:>3}] ({:>3} chars) {}", i + 1, chunk.chars().count(), chunk);
            }
            println!("\n{} chunk(s)", chunks.len());
        }

        Commands::Migrate => {
            let pool = connect(&cli).await?;
            run_migrations(&pool).await?;
            println!("Migrations applied");
        }
    }

    Ok(())
}

async fn connect(cli: &Cli) -> Result<reading_worker::db::DbPool> {
    let url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL not set (use --database-url or the environment)")?;
    let pool = create_pool(url, cli.max_connections).await?;
    info!("Database connection established");
    Ok(pool)
}

async fn pg_store(cli: &Cli) -> Result<Arc<dyn TaskStore>> {
    Ok(Arc::new(PgTaskStore::new(connect(cli).await?)))
}

async fn run_worker(cli: &Cli, args: &WorkerArgs) -> Result<()> {
    info!("Initializing worker...");

    let (store, artifacts): (Arc<dyn TaskStore>, Arc<dyn ArtifactStore>) = if args.memory {
        let store = Arc::new(MemoryTaskStore::default());
        if let Some(path) = &args.seed_text {
            seed_memory_job(&store, path, args.seed_max_attempts).await?;
        }
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        (store as Arc<dyn TaskStore>, artifacts)
    } else {
        let artifacts: Arc<dyn ArtifactStore> = match args.storage {
            StorageKind::Local => Arc::new(LocalArtifactStore::new(&args.artifact_dir)),
            StorageKind::Supabase => {
                Arc::new(HttpArtifactStore::new(HttpStorageConfig::from_env()?)?)
            }
        };
        (pg_store(cli).await?, artifacts)
    };

    let mut builder = WorkerConfig::builder()
        .max_concurrent_tasks(args.concurrency)
        .poll_interval(Duration::from_millis(args.poll_interval_ms))
        .max_poll_interval(Duration::from_millis(args.max_poll_interval_ms))
        .heartbeat_interval(Duration::from_secs(args.heartbeat_secs))
        .task_timeout(Duration::from_secs(args.timeout))
        .dependency_retry_delay(Duration::from_secs(args.dependency_retry_secs));
    if let Some(id) = &args.worker_id {
        builder = builder.worker_id(id.clone());
    }
    let config = builder.build();

    let provider = Arc::new(HttpSpeechProvider::new(HttpSpeechConfig::from_env()?)?);
    let transcoder = Arc::new(match &args.ffmpeg {
        Some(path) => FfmpegTranscoder::new(path),
        None => FfmpegTranscoder::locate()?,
    });
    let audio_config = AudioConfig {
        chunk_max_len: args.chunk_max_len,
        synthesis: SynthesisConfig {
            inter_chunk_delay: Duration::from_millis(args.inter_chunk_delay_ms),
            chunk_retries: args.chunk_retries,
            concurrency: args.synthesis_concurrency,
            ..SynthesisConfig::default()
        },
        ..AudioConfig::default()
    };
    let processor = AudioTaskProcessor::new(provider, transcoder, audio_config)?;
    let runner = TaskRunner::new(store, artifacts, config, processor);

    if args.once {
        // Run once mode
        info!("Running in single-iteration mode...");
        match runner.run_once().await {
            Ok(0) => println!("No pending tasks found"),
            Ok(n) => println!("Processed {} task(s)", n),
            Err(e) => {
                eprintln!("Error processing tasks: {}", e);
                return Err(e.into());
            }
        }
    } else {
        // Setup graceful shutdown
        setup_signal_handler(runner.shutdown_handle());
        runner.run().await?;
    }

    Ok(())
}

async fn seed_memory_job(store: &MemoryTaskStore, path: &Path, max_attempts: i32) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let job = store.insert_job(NewJob {
        job_type: "reading".to_string(),
        params: serde_json::json!({ "source": path.display().to_string() }),
    });
    store
        .enqueue(&NewTask {
            job_id: job.id,
            task_type: TaskType::AudioGeneration,
            sequence: 0,
            input: serde_json::json!({ "source": { "inline": text } }),
            max_attempts,
        })
        .await?;
    info!("Seeded job {} from {}", job.id, path.display());
    Ok(())
}
