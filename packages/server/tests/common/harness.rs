//! Test harness with testcontainers for integration testing.
//!
//! Uses a shared container across all tests for dramatically improved
//! performance. The container and migrations are initialized once on the
//! first test, then reused.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::{Mutex, OnceCell};

use ingest_core::kernel::jobs::{JobQueue, PostgresJobQueue};
use ingest_core::kernel::test_dependencies::{MockCrawler, MockTrainer};
use ingest_core::kernel::{CircuitBreakerRegistry, ServerDeps};

/// Serializes tests that run store-wide scans: processor passes, stalled
/// recovery, synchronization. Those scans see every row in the shared
/// database, so two of them at once would claim each other's fixtures.
pub static STORE_SCAN_LOCK: Mutex<()> = Mutex::const_new(());

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        // Run migrations once on the shared database
        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Everything a pipeline integration test needs: real store, real queue,
/// mock crawl and training services.
pub struct PipelineHandles {
    pub deps: Arc<ServerDeps>,
    pub queue: Arc<dyn JobQueue>,
    pub crawler: Arc<MockCrawler>,
    pub trainer: Arc<MockTrainer>,
}

/// Test harness that manages test infrastructure.
///
/// Each test gets a fresh pool and fresh mocks, but reuses the same
/// database container.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let handles = ctx.pipeline();
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    /// Database pool - use this for test fixtures.
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        // Database pool is automatically dropped
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self { db_pool })
    }

    /// Pipeline dependencies over the real store with default mocks.
    pub fn pipeline(&self) -> PipelineHandles {
        self.pipeline_with(Arc::new(MockCrawler::new()), Arc::new(MockTrainer::new()))
    }

    /// Pipeline dependencies with caller-configured mocks.
    pub fn pipeline_with(
        &self,
        crawler: Arc<MockCrawler>,
        trainer: Arc<MockTrainer>,
    ) -> PipelineHandles {
        let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(self.db_pool.clone()));
        let deps = Arc::new(ServerDeps::new(
            self.db_pool.clone(),
            queue.clone(),
            Arc::new(CircuitBreakerRegistry::new()),
            crawler.clone(),
            trainer.clone(),
        ));
        PipelineHandles {
            deps,
            queue,
            crawler,
            trainer,
        }
    }
}
