//! Reading Worker - durable task-queue workers for long-running generation jobs
//!
//! Jobs are split into tasks stored in Postgres. Workers claim tasks under a
//! heartbeat-renewed lease, process them, and settle them as complete, requeued
//! or failed. A watchdog returns abandoned leases to the queue.
//!
//! The bundled handler turns text into narrated audio:
//! - chunk text under the provider's input limit
//! - synthesize chunks in order with pacing and per-chunk retries
//! - normalize WAV output to 16-bit PCM and concatenate it
//! - transcode to a loudness-normalized compressed file
//!
//! # Example
//! ```ignore
//! use reading_worker::{db, worker, artifacts, audio};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> reading_worker::Result<()> {
//!     let pool = db::create_pool_from_env().await?;
//!     let store = Arc::new(db::PgTaskStore::new(pool));
//!     let artifacts = Arc::new(artifacts::LocalArtifactStore::new("./artifacts"));
//!     let provider = Arc::new(audio::HttpSpeechProvider::new(audio::HttpSpeechConfig::from_env()?)?);
//!     let transcoder = Arc::new(audio::FfmpegTranscoder::locate()?);
//!     let handler = audio::AudioTaskProcessor::new(provider, transcoder, Default::default())?;
//!
//!     let runner = worker::TaskRunner::new(store, artifacts, Default::default(), handler);
//!     runner.run().await
//! }
//! ```

pub mod artifacts;
pub mod audio;
pub mod clock;
pub mod db;
pub mod error;
pub mod notify;
pub mod watchdog;
pub mod worker;

pub use error::{Result, WorkerError};
pub use watchdog::{SweepReport, Watchdog, WatchdogConfig};
pub use worker::{TaskRunner, WorkerConfig};
