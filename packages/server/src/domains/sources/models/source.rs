use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::SourceId;
use crate::domains::sources::status::WorkflowStatus;

/// Source - a knowledge source whose pages are crawled and trained into
/// the assistant's index.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    pub workflow_status: WorkflowStatus,
    /// Status captured when entering pending_removal, for restore
    pub previous_status: Option<WorkflowStatus>,
    pub error_message: Option<String>,
    pub page_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub async fn create(name: &str, url: &str, pool: &PgPool) -> Result<Self> {
        let normalized = Self::normalize_url(url)?;
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO sources (id, name, url)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(SourceId::new())
        .bind(name)
        .bind(&normalized)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Find by URL or create, normalizing first. Returns whether the row
    /// was created.
    pub async fn find_or_create(name: &str, url: &str, pool: &PgPool) -> Result<(Self, bool)> {
        let normalized = Self::normalize_url(url)?;
        if let Some(existing) = Self::find_by_url(&normalized, pool).await? {
            return Ok((existing, false));
        }
        let source = Self::create(name, &normalized, pool).await?;
        Ok((source, true))
    }

    pub async fn find_by_id(id: SourceId, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM sources WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_id_optional(id: SourceId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sources WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_url(url: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sources WHERE url = $1")
            .bind(url)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_status(status: WorkflowStatus, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM sources WHERE workflow_status = $1 ORDER BY created_at",
        )
        .bind(status)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_recent(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sources ORDER BY created_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn update_page_count(id: SourceId, page_count: i32, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE sources SET page_count = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(page_count)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Normalize a source URL for consistent storage: default to https,
    /// lowercase the host, drop any fragment, trim a bare trailing slash.
    pub fn normalize_url(input: &str) -> Result<String> {
        let input = input.trim();

        let with_protocol = if input.starts_with("http://") || input.starts_with("https://") {
            input.to_string()
        } else {
            format!("https://{}", input)
        };

        let mut parsed = url::Url::parse(&with_protocol)?;
        if parsed.host_str().is_none() {
            anyhow::bail!("No host in source url: {}", input);
        }
        parsed.set_fragment(None);

        let mut normalized = parsed.to_string();
        if parsed.path() == "/" && parsed.query().is_none() && normalized.ends_with('/') {
            normalized.pop();
        }

        Ok(normalized)
    }
}
