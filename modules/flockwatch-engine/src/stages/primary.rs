use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use flockwatch_common::{Classification, DiscoveredAccount, TopicConfig};

use crate::classifier::{AccountContent, BatchClassifier, ClassifiedAccount, PRIMARY_CATEGORIES};
use crate::content::{filter_topic_posts, ContentSource};
use crate::limiter::FetchLimiter;
use crate::stages::AnalyzeOutcome;
use crate::store::AccountStore;

/// Concurrent timeline fetches during a batch pass. The shared
/// `FetchLimiter` is the real gate; this just bounds task fan-out.
const FETCH_FANOUT: usize = 8;

pub struct PrimaryStage {
    content: Arc<dyn ContentSource>,
    store: Arc<dyn AccountStore>,
    classifier: Arc<BatchClassifier>,
    limiter: FetchLimiter,
    timeline_max_items: u32,
}

impl PrimaryStage {
    pub fn new(
        content: Arc<dyn ContentSource>,
        store: Arc<dyn AccountStore>,
        classifier: Arc<BatchClassifier>,
        limiter: FetchLimiter,
        timeline_max_items: u32,
    ) -> Self {
        Self {
            content,
            store,
            classifier,
            limiter,
            timeline_max_items,
        }
    }

    /// Classify one account from its topic-scoped posts. Duplicate jobs
    /// for an already-classified account are no-ops.
    pub async fn analyze(
        &self,
        config: &TopicConfig,
        account_id: &str,
        handle: &str,
    ) -> Result<AnalyzeOutcome> {
        if self.store.get_classification(account_id).await?.is_some() {
            debug!(handle, "Account already classified, skipping primary pass");
            return Ok(AnalyzeOutcome::Skipped);
        }

        let posts = self.fetch_topic_posts(handle, &config.keywords).await?;
        let result = self
            .classifier
            .classify_one(
                &config.primary_prompt,
                AccountContent {
                    account_id: account_id.to_string(),
                    handle: handle.to_string(),
                    posts,
                },
                PRIMARY_CATEGORIES,
            )
            .await;

        self.persist(&result).await?;
        info!(handle, category = %result.category, "Primary classification stored");
        Ok(AnalyzeOutcome::Classified(result.category))
    }

    /// Batch path used by the in-process fallback run: fetch all
    /// timelines (limiter-gated fan-out), classify in batches, persist.
    /// Returns one result per account that still needed classification.
    pub async fn analyze_many(
        &self,
        config: &TopicConfig,
        accounts: Vec<DiscoveredAccount>,
    ) -> Result<Vec<ClassifiedAccount>> {
        let mut fresh = Vec::with_capacity(accounts.len());
        for account in accounts {
            if self
                .store
                .get_classification(&account.account_id)
                .await?
                .is_none()
            {
                fresh.push(account);
            }
        }

        let contents: Vec<AccountContent> = stream::iter(fresh.into_iter().map(|account| {
            async move {
                let posts = match self.fetch_topic_posts(&account.handle, &config.keywords).await
                {
                    Ok(posts) => posts,
                    Err(e) => {
                        // Tolerated per account: no content means the
                        // classifier short-circuits to insufficient data.
                        warn!(handle = account.handle.as_str(), error = %e, "Timeline fetch failed");
                        Vec::new()
                    }
                };
                AccountContent {
                    account_id: account.account_id,
                    handle: account.handle,
                    posts,
                }
            }
        }))
        .buffer_unordered(FETCH_FANOUT)
        .collect()
        .await;

        let results = self
            .classifier
            .classify_batch(&config.primary_prompt, contents, PRIMARY_CATEGORIES)
            .await;

        for result in &results {
            self.persist(result).await?;
        }
        Ok(results)
    }

    async fn fetch_topic_posts(&self, handle: &str, keywords: &[String]) -> Result<Vec<String>> {
        let _permit = self.limiter.acquire().await?;
        let posts = self
            .content
            .fetch_timeline(handle, self.timeline_max_items)
            .await?;
        Ok(filter_topic_posts(&posts, keywords)
            .into_iter()
            .map(|p| p.text)
            .collect())
    }

    async fn persist(&self, result: &ClassifiedAccount) -> Result<()> {
        self.store
            .write_classification(&Classification {
                account_id: result.account_id.clone(),
                category: result.category,
                confidence: result.confidence,
                reasoning: result.reasoning.clone(),
                classified_at: Utc::now(),
                secondary_pass: false,
            })
            .await
    }
}
