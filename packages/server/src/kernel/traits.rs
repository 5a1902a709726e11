// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Business logic (like "advance the crawl workflow") lives in domain
// functions that use these traits.
//
// Naming convention: Base* for trait names (e.g., BaseCrawler, BaseTrainer)

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Crawler Trait (Infrastructure - external crawl service)
// =============================================================================

/// A page the crawler found under a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPage {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Result of crawling a single page. Content itself stays on the crawler
/// side; the pipeline only tracks metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlReport {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[async_trait]
pub trait BaseCrawler: Send + Sync {
    /// Discover the pages reachable under a source URL
    async fn discover(&self, source_url: &str) -> Result<Vec<DiscoveredPage>>;

    /// Fetch and store the content of one page
    async fn crawl_page(&self, page_url: &str) -> Result<CrawlReport>;
}

// =============================================================================
// Trainer Trait (Infrastructure - knowledge base ingestion)
// =============================================================================

/// Result of training on one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    #[serde(default)]
    pub chunks_indexed: i64,
}

#[async_trait]
pub trait BaseTrainer: Send + Sync {
    /// Index one crawled page into the assistant's knowledge base
    async fn train_page(&self, page_url: &str) -> Result<TrainReport>;

    /// Remove everything indexed for a source (used by hard deletion)
    async fn forget_source(&self, source_url: &str) -> Result<()>;
}
