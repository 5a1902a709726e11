//! HTTP clients for the external crawl and training services.
//!
//! Crawling internals (fetching, parsing, content storage) and the
//! training stack live behind these endpoints; this process only
//! orchestrates them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BaseCrawler, BaseTrainer, CrawlReport, DiscoveredPage, TrainReport};

/// Crawler service client.
pub struct HttpCrawler {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct DiscoverRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    pages: Vec<DiscoveredPage>,
}

#[derive(Debug, Serialize)]
struct CrawlRequest<'a> {
    url: &'a str,
}

impl HttpCrawler {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl BaseCrawler for HttpCrawler {
    async fn discover(&self, source_url: &str) -> Result<Vec<DiscoveredPage>> {
        let response = self
            .request("/discover")
            .json(&DiscoverRequest { url: source_url })
            .send()
            .await
            .context("Failed to send discover request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Crawler API error {}: {}", status, body);
        }

        let discovered: DiscoverResponse = response
            .json()
            .await
            .context("Failed to parse discover response")?;

        Ok(discovered.pages)
    }

    async fn crawl_page(&self, page_url: &str) -> Result<CrawlReport> {
        let response = self
            .request("/crawl")
            .json(&CrawlRequest { url: page_url })
            .send()
            .await
            .context("Failed to send crawl request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Crawler API error {}: {}", status, body);
        }

        let report: CrawlReport = response
            .json()
            .await
            .context("Failed to parse crawl response")?;

        Ok(report)
    }
}

/// Training service client.
pub struct HttpTrainer {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct TrainRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct ForgetRequest<'a> {
    url: &'a str,
}

impl HttpTrainer {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl BaseTrainer for HttpTrainer {
    async fn train_page(&self, page_url: &str) -> Result<TrainReport> {
        let response = self
            .request("/train")
            .json(&TrainRequest { url: page_url })
            .send()
            .await
            .context("Failed to send train request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Trainer API error {}: {}", status, body);
        }

        let report: TrainReport = response
            .json()
            .await
            .context("Failed to parse train response")?;

        Ok(report)
    }

    async fn forget_source(&self, source_url: &str) -> Result<()> {
        let response = self
            .request("/forget")
            .json(&ForgetRequest { url: source_url })
            .send()
            .await
            .context("Failed to send forget request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Trainer API error {}: {}", status, body);
        }

        Ok(())
    }
}
