//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::domains::sources::jobs::PipelineJobProcessor;
use crate::kernel::health::HealthMonitor;
use crate::kernel::jobs::{
    JobQueue, JobRecoveryService, JobRunner, JobRunnerConfig, PostgresJobQueue,
    SynchronizationService,
};
use crate::kernel::{CircuitBreakerRegistry, HttpCrawler, HttpTrainer, ServerDeps};
use crate::server::routes::{admin, health_handler, sources};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub deps: Arc<ServerDeps>,
    pub recovery: Arc<JobRecoveryService>,
    pub sync: Arc<SynchronizationService>,
    pub health: Arc<HealthMonitor>,
}

/// Build the Axum application router and the shared state behind it.
///
/// The embedded job runner is spawned here. Scheduled tasks are started by
/// the caller from the returned state, so a dedicated worker process can
/// reuse this wiring without doubling the schedules.
pub async fn build_app(pool: PgPool, config: &Config) -> Result<(Router, AppState)> {
    let crawler = Arc::new(HttpCrawler::new(
        config.crawler_url.clone(),
        config.pipeline_api_key.clone(),
    )?);
    let trainer = Arc::new(HttpTrainer::new(
        config.trainer_url.clone(),
        config.pipeline_api_key.clone(),
    )?);

    // Job queue with PostgreSQL backend
    let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(pool.clone()));
    let breakers = Arc::new(CircuitBreakerRegistry::new());

    let deps = Arc::new(ServerDeps::new(
        pool.clone(),
        queue.clone(),
        breakers,
        crawler,
        trainer,
    ));

    let recovery = Arc::new(JobRecoveryService::new(pool.clone(), queue.clone()));
    let sync = Arc::new(SynchronizationService::new(pool.clone(), queue.clone()));
    let health = Arc::new(HealthMonitor::new(
        pool.clone(),
        deps.breakers.clone(),
        recovery.clone(),
        sync.clone(),
    ));

    // Create and spawn the embedded job runner as a background task
    let processor = Arc::new(PipelineJobProcessor::new(deps.clone()));
    let runner_config = JobRunnerConfig {
        batch_size: config.job_batch_size,
        max_concurrent_jobs: config.max_concurrent_jobs,
        job_timeout: Duration::from_millis(config.job_timeout_ms),
        ..JobRunnerConfig::default()
    };
    let runner = JobRunner::with_config(queue, processor, runner_config);
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::error!(error = %e, "Job runner exited with error");
        }
    });

    // Create shared app state
    let app_state = AppState {
        db_pool: pool,
        deps,
        recovery,
        sync,
        health,
    };

    // CORS configuration - allow any origin for development
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/sources",
            post(sources::create_source).get(sources::list_sources),
        )
        .route(
            "/sources/:id",
            get(sources::get_source).delete(sources::delete_source),
        )
        .route("/sources/:id/pages", get(sources::get_source_pages))
        .route("/sources/:id/events", get(sources::get_source_events))
        .route("/sources/:id/crawl", post(sources::start_crawl))
        .route("/sources/:id/train", post(sources::start_training))
        .route("/sources/:id/remove", post(sources::request_removal))
        .route("/sources/:id/restore", post(sources::restore_source))
        .route("/admin/status", get(admin::system_status))
        .route("/admin/synchronize", post(admin::force_synchronization))
        .route("/admin/recovery", post(admin::run_recovery))
        .route("/admin/sources/:id/recover", post(admin::emergency_recovery))
        .route("/admin/breakers", get(admin::list_breakers))
        .route("/admin/breakers/:name/reset", post(admin::reset_breaker))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(app_state.clone()))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok((app, app_state))
}
