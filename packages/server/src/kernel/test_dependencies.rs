// TestDependencies - mock implementations for testing
//
// Provides mock crawler and trainer services plus an in-memory queue that
// can be injected into ServerDeps for tests.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::kernel::breaker::CircuitBreakerRegistry;
use crate::kernel::jobs::testing::InMemoryJobQueue;
use crate::kernel::traits::{BaseCrawler, BaseTrainer, CrawlReport, DiscoveredPage, TrainReport};
use crate::kernel::ServerDeps;

// =============================================================================
// Mock Crawler
// =============================================================================

pub struct MockCrawler {
    pages: Arc<Mutex<Vec<DiscoveredPage>>>,
    discover_calls: Arc<Mutex<Vec<String>>>,
    crawl_calls: Arc<Mutex<Vec<String>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl MockCrawler {
    pub fn new() -> Self {
        Self {
            pages: Arc::new(Mutex::new(Vec::new())),
            discover_calls: Arc::new(Mutex::new(Vec::new())),
            crawl_calls: Arc::new(Mutex::new(Vec::new())),
            fail_with: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the pages discovery will report.
    pub fn with_pages(self, urls: Vec<&str>) -> Self {
        {
            let mut pages = self.pages.lock().unwrap();
            *pages = urls
                .into_iter()
                .map(|url| DiscoveredPage {
                    url: url.to_string(),
                    title: Some(format!("Page: {url}")),
                })
                .collect();
        }
        self
    }

    /// Make every crawler call fail with the given error.
    pub fn failing(self, error: &str) -> Self {
        *self.fail_with.lock().unwrap() = Some(error.to_string());
        self
    }

    /// Get all URLs discovery was asked about.
    pub fn discover_calls(&self) -> Vec<String> {
        self.discover_calls.lock().unwrap().clone()
    }

    /// Get all URLs that were crawled.
    pub fn crawl_calls(&self) -> Vec<String> {
        self.crawl_calls.lock().unwrap().clone()
    }

    /// Check if a URL was crawled.
    pub fn was_crawled(&self, url: &str) -> bool {
        self.crawl_calls.lock().unwrap().iter().any(|u| u == url)
    }
}

impl Default for MockCrawler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseCrawler for MockCrawler {
    async fn discover(&self, source_url: &str) -> Result<Vec<DiscoveredPage>> {
        self.discover_calls
            .lock()
            .unwrap()
            .push(source_url.to_string());

        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            bail!("{error}");
        }
        Ok(self.pages.lock().unwrap().clone())
    }

    async fn crawl_page(&self, page_url: &str) -> Result<CrawlReport> {
        self.crawl_calls.lock().unwrap().push(page_url.to_string());

        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            bail!("{error}");
        }
        Ok(CrawlReport {
            url: page_url.to_string(),
            title: Some(format!("Page: {page_url}")),
        })
    }
}

// =============================================================================
// Mock Trainer
// =============================================================================

pub struct MockTrainer {
    train_calls: Arc<Mutex<Vec<String>>>,
    forget_calls: Arc<Mutex<Vec<String>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl MockTrainer {
    pub fn new() -> Self {
        Self {
            train_calls: Arc::new(Mutex::new(Vec::new())),
            forget_calls: Arc::new(Mutex::new(Vec::new())),
            fail_with: Arc::new(Mutex::new(None)),
        }
    }

    /// Make every trainer call fail with the given error.
    pub fn failing(self, error: &str) -> Self {
        *self.fail_with.lock().unwrap() = Some(error.to_string());
        self
    }

    /// Get all URLs that were trained.
    pub fn train_calls(&self) -> Vec<String> {
        self.train_calls.lock().unwrap().clone()
    }

    /// Get all source URLs that were forgotten.
    pub fn forget_calls(&self) -> Vec<String> {
        self.forget_calls.lock().unwrap().clone()
    }

    /// Check if a URL was trained.
    pub fn was_trained(&self, url: &str) -> bool {
        self.train_calls.lock().unwrap().iter().any(|u| u == url)
    }
}

impl Default for MockTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseTrainer for MockTrainer {
    async fn train_page(&self, page_url: &str) -> Result<TrainReport> {
        self.train_calls.lock().unwrap().push(page_url.to_string());

        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            bail!("{error}");
        }
        Ok(TrainReport { chunks_indexed: 3 })
    }

    async fn forget_source(&self, source_url: &str) -> Result<()> {
        self.forget_calls
            .lock()
            .unwrap()
            .push(source_url.to_string());

        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            bail!("{error}");
        }
        Ok(())
    }
}

// =============================================================================
// TestDependencies
// =============================================================================

pub struct TestDependencies {
    pub crawler: Arc<MockCrawler>,
    pub trainer: Arc<MockTrainer>,
    pub queue: Arc<InMemoryJobQueue>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            crawler: Arc::new(MockCrawler::new()),
            trainer: Arc::new(MockTrainer::new()),
            queue: Arc::new(InMemoryJobQueue::new()),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
        }
    }

    /// Set a mock crawler
    pub fn mock_crawler(mut self, crawler: MockCrawler) -> Self {
        self.crawler = Arc::new(crawler);
        self
    }

    /// Set a mock trainer
    pub fn mock_trainer(mut self, trainer: MockTrainer) -> Self {
        self.trainer = Arc::new(trainer);
        self
    }

    /// Convert into ServerDeps backed by the given pool.
    pub fn into_deps(self, db_pool: PgPool) -> Arc<ServerDeps> {
        Arc::new(ServerDeps::new(
            db_pool,
            self.queue,
            self.breakers,
            self.crawler,
            self.trainer,
        ))
    }

    /// Deps with a lazily connected pool, for tests that never reach the
    /// database.
    pub fn into_lazy_deps(self) -> Arc<ServerDeps> {
        let pool = PgPool::connect_lazy("postgres://localhost/test")
            .expect("lazy pool construction cannot fail");
        self.into_deps(pool)
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
