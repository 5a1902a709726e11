use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub crawler_url: String,
    pub trainer_url: String,
    pub pipeline_api_key: Option<String>,
    pub max_concurrent_jobs: usize,
    pub job_batch_size: i64,
    pub job_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            crawler_url: env::var("CRAWLER_URL")
                .context("CRAWLER_URL must be set")?,
            trainer_url: env::var("TRAINER_URL")
                .context("TRAINER_URL must be set")?,
            pipeline_api_key: env::var("PIPELINE_API_KEY").ok(),
            max_concurrent_jobs: env::var("MAX_CONCURRENT_JOBS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("MAX_CONCURRENT_JOBS must be a valid number")?,
            job_batch_size: env::var("JOB_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("JOB_BATCH_SIZE must be a valid number")?,
            job_timeout_ms: env::var("JOB_TIMEOUT_MS")
                .unwrap_or_else(|_| "300000".to_string())
                .parse()
                .context("JOB_TIMEOUT_MS must be a valid number")?,
        })
    }
}
