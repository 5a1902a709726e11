//! Server dependencies for job handlers and routes.
//!
//! This module provides the central dependency container used by job
//! handlers, scheduled tasks and HTTP routes. External services sit behind
//! traits so everything can be exercised with in-memory doubles.

use std::sync::Arc;

use sqlx::PgPool;

use crate::domains::sources::workflow::WorkflowEngine;
use crate::kernel::breaker::CircuitBreakerRegistry;
use crate::kernel::jobs::JobQueue;
use crate::kernel::traits::{BaseCrawler, BaseTrainer};

/// Server dependencies accessible to job handlers and routes.
#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    /// Job queue; the store is the only arbiter of claims.
    pub queue: Arc<dyn JobQueue>,
    /// Per-dependency circuit breakers, keyed by service name.
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// External crawl service.
    pub crawler: Arc<dyn BaseCrawler>,
    /// Knowledge base ingestion service.
    pub trainer: Arc<dyn BaseTrainer>,
}

impl ServerDeps {
    pub fn new(
        db_pool: PgPool,
        queue: Arc<dyn JobQueue>,
        breakers: Arc<CircuitBreakerRegistry>,
        crawler: Arc<dyn BaseCrawler>,
        trainer: Arc<dyn BaseTrainer>,
    ) -> Self {
        Self {
            db_pool,
            queue,
            breakers,
            crawler,
            trainer,
        }
    }

    /// Workflow engine bound to this container's pool and queue.
    pub fn workflow(&self) -> WorkflowEngine {
        WorkflowEngine::new(self.db_pool.clone(), self.queue.clone())
    }
}
