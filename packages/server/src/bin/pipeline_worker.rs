//! Standalone pipeline worker.
//!
//! Processes jobs from the shared queue without serving HTTP. Run as many
//! of these as throughput needs; the store-level claim keeps them from
//! stepping on each other.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ingest_core::domains::sources::jobs::PipelineJobProcessor;
use ingest_core::kernel::jobs::{JobQueue, JobRunner, JobRunnerConfig, PostgresJobQueue};
use ingest_core::kernel::{CircuitBreakerRegistry, HttpCrawler, HttpTrainer, ServerDeps};
use ingest_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pipeline_worker")]
#[command(about = "Background worker for the content ingestion pipeline")]
struct Cli {
    /// Maximum jobs fetched per pass
    #[arg(long)]
    batch_size: Option<i64>,

    /// Maximum jobs in flight at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Seconds to sleep when the queue is empty
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,

    /// Only process these job types (repeat the flag for several)
    #[arg(long = "job-type")]
    job_types: Vec<String>,

    /// Worker ID; defaults to a generated one
    #[arg(long)]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ingest_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let crawler = Arc::new(HttpCrawler::new(
        config.crawler_url.clone(),
        config.pipeline_api_key.clone(),
    )?);
    let trainer = Arc::new(HttpTrainer::new(
        config.trainer_url.clone(),
        config.pipeline_api_key.clone(),
    )?);
    let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(pool.clone()));
    let deps = Arc::new(ServerDeps::new(
        pool,
        queue.clone(),
        Arc::new(CircuitBreakerRegistry::new()),
        crawler,
        trainer,
    ));

    let processor = Arc::new(PipelineJobProcessor::new(deps));

    let mut runner_config = match cli.worker_id {
        Some(id) => JobRunnerConfig::with_worker_id(id),
        None => JobRunnerConfig::default(),
    };
    runner_config.batch_size = cli.batch_size.unwrap_or(config.job_batch_size);
    runner_config.max_concurrent_jobs = cli.max_concurrent.unwrap_or(config.max_concurrent_jobs);
    runner_config.job_timeout = Duration::from_millis(config.job_timeout_ms);
    runner_config.poll_interval = Duration::from_secs(cli.poll_interval);
    if !cli.job_types.is_empty() {
        runner_config.job_types = Some(cli.job_types);
    }

    tracing::info!(worker_id = %runner_config.worker_id, "Starting pipeline worker");

    let runner = JobRunner::with_config(queue, processor, runner_config);
    runner.run_until_shutdown().await
}
