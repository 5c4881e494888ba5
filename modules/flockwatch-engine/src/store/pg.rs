use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use flockwatch_common::{Category, Classification, DiscoveredAccount, TopicConfig};

use super::{AccountStore, ConfigStore};

/// Create the pipeline's tables if they do not exist yet. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            handle TEXT NOT NULL,
            display_name TEXT,
            bio TEXT,
            followers BIGINT NOT NULL DEFAULT 0,
            discovered_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classifications (
            account_id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            confidence REAL NOT NULL,
            reasoning TEXT,
            classified_at TIMESTAMPTZ NOT NULL,
            secondary_pass BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topic_configs (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            keywords JSONB NOT NULL,
            primary_prompt TEXT NOT NULL,
            secondary_prompt TEXT NOT NULL,
            default_max_pages INTEGER NOT NULL DEFAULT 3
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn upsert_account(&self, account: &DiscoveredAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, handle, display_name, bio, followers, discovered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id) DO UPDATE SET
                handle = EXCLUDED.handle,
                display_name = EXCLUDED.display_name,
                bio = EXCLUDED.bio,
                followers = EXCLUDED.followers
            "#,
        )
        .bind(&account.account_id)
        .bind(&account.handle)
        .bind(&account.display_name)
        .bind(&account.bio)
        .bind(account.followers as i64)
        .bind(account.discovered_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert account")?;
        Ok(())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<DiscoveredAccount>> {
        let row = sqlx::query(
            "SELECT account_id, handle, display_name, bio, followers, discovered_at
             FROM accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read account")?;

        Ok(row.map(|r| DiscoveredAccount {
            account_id: r.get("account_id"),
            handle: r.get("handle"),
            display_name: r.get("display_name"),
            bio: r.get("bio"),
            followers: r.get::<i64, _>("followers").max(0) as u64,
            discovered_at: r.get::<DateTime<Utc>, _>("discovered_at"),
        }))
    }

    async fn get_classification(&self, account_id: &str) -> Result<Option<Classification>> {
        let row = sqlx::query(
            "SELECT account_id, category, confidence, reasoning, classified_at, secondary_pass
             FROM classifications WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read classification")?;

        row.map(|r| {
            let category_str: String = r.get("category");
            let category = Category::parse(&category_str)
                .ok_or_else(|| anyhow!("Unknown category in classifications: {category_str}"))?;
            Ok(Classification {
                account_id: r.get("account_id"),
                category,
                confidence: r.get("confidence"),
                reasoning: r.get("reasoning"),
                classified_at: r.get::<DateTime<Utc>, _>("classified_at"),
                secondary_pass: r.get("secondary_pass"),
            })
        })
        .transpose()
    }

    async fn write_classification(&self, classification: &Classification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO classifications
                (account_id, category, confidence, reasoning, classified_at, secondary_pass)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id) DO UPDATE SET
                category = EXCLUDED.category,
                confidence = EXCLUDED.confidence,
                reasoning = EXCLUDED.reasoning,
                classified_at = EXCLUDED.classified_at,
                secondary_pass = EXCLUDED.secondary_pass
            "#,
        )
        .bind(&classification.account_id)
        .bind(classification.category.as_str())
        .bind(classification.confidence)
        .bind(&classification.reasoning)
        .bind(classification.classified_at)
        .bind(classification.secondary_pass)
        .execute(&self.pool)
        .await
        .context("Failed to write classification")?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get_config(&self, id: Uuid) -> Result<Option<TopicConfig>> {
        let row = sqlx::query(
            "SELECT id, name, keywords, primary_prompt, secondary_prompt, default_max_pages
             FROM topic_configs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read topic config")?;

        row.map(|r| {
            let keywords: serde_json::Value = r.get("keywords");
            let keywords: Vec<String> = serde_json::from_value(keywords)
                .context("Malformed keywords in topic config")?;
            Ok(TopicConfig {
                id: r.get("id"),
                name: r.get("name"),
                keywords,
                primary_prompt: r.get("primary_prompt"),
                secondary_prompt: r.get("secondary_prompt"),
                default_max_pages: r.get::<i32, _>("default_max_pages").max(0) as u32,
            })
        })
        .transpose()
    }
}
