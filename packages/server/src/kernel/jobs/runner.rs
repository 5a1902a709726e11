//! Job runner service for processing background jobs.
//!
//! The `JobRunner` is a background service that:
//! - Polls the store for ready jobs
//! - Executes each pass through the [`ConcurrentJobProcessor`]
//! - Sleeps between passes when the queue is drained
//!
//! # Architecture
//!
//! ```text
//! JobRunner
//!     │
//!     ├─► process_concurrent_jobs (fetch, claim, execute)
//!     ├─► queue empty ─► sleep poll_interval
//!     └─► queue busy  ─► next pass immediately
//! ```
//!
//! # Example
//!
//! ```ignore
//! let processor = Arc::new(PipelineJobProcessor::new(deps));
//! let runner = JobRunner::new(job_queue, processor);
//!
//! // Spawn as background task
//! tokio::spawn(runner.run());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};
use uuid::Uuid;

use super::processor::{ConcurrentJobProcessor, JobProcessor, ProcessorOptions};
use super::queue::JobQueue;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Maximum number of jobs fetched per pass
    pub batch_size: i64,
    /// Maximum number of jobs in flight at once
    pub max_concurrent_jobs: usize,
    /// Per-job processing timeout
    pub job_timeout: Duration,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// Only process these job types (None = all)
    pub job_types: Option<Vec<String>>,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_jobs: 5,
            job_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            job_types: None,
            worker_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

impl JobRunnerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            batch_size: self.batch_size,
            max_concurrent_jobs: self.max_concurrent_jobs,
            job_timeout: self.job_timeout,
            job_types: self.job_types.clone(),
            worker_id: self.worker_id.clone(),
        }
    }
}

/// Background service that processes jobs from the queue.
///
/// Each pass claims up to `batch_size` jobs and runs them with bounded
/// concurrency. Retries, timeouts, and exhaustion are handled inside the
/// pass; the runner only decides when the next pass starts.
pub struct JobRunner {
    engine: ConcurrentJobProcessor,
    processor: Arc<dyn JobProcessor>,
    config: JobRunnerConfig,
    shutdown: Arc<AtomicBool>,
}

impl JobRunner {
    /// Create a new job runner with default configuration.
    pub fn new(job_queue: Arc<dyn JobQueue>, processor: Arc<dyn JobProcessor>) -> Self {
        Self::with_config(job_queue, processor, JobRunnerConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(
        job_queue: Arc<dyn JobQueue>,
        processor: Arc<dyn JobProcessor>,
        config: JobRunnerConfig,
    ) -> Self {
        let engine = ConcurrentJobProcessor::new(job_queue, config.processor_options());
        Self {
            engine,
            processor,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a shutdown handle for graceful shutdown.
    ///
    /// Call `store(true, Ordering::SeqCst)` on the returned Arc to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Request shutdown of the runner.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown has been requested.
    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run the job runner until shutdown is requested.
    ///
    /// This is the main loop that runs processing passes back to back while
    /// work is available. Call `request_shutdown()` to stop it gracefully;
    /// the pass in flight finishes first.
    pub async fn run(self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job runner starting"
        );

        loop {
            if self.is_shutdown_requested() {
                break;
            }

            match self.engine.process_concurrent_jobs(self.processor.clone()).await {
                Ok(outcome) if outcome.total_processed == 0 => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(_) => {
                    // More work may be ready; start the next pass right away
                }
                Err(e) => {
                    error!(error = %e, "processing pass failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
        Ok(())
    }

    /// Run until a shutdown signal is received.
    ///
    /// Convenience method that listens for Ctrl+C.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown_handle();

        // Spawn signal handler
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.run().await
    }
}
