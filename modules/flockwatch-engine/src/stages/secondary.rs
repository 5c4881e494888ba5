use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use flockwatch_common::{Category, Classification, TopicConfig};

use crate::classifier::{
    AccountContent, BatchClassifier, ClassifiedAccount, SECONDARY_CATEGORIES,
};
use crate::content::{filter_topic_posts, ContentSource};
use crate::limiter::FetchLimiter;
use crate::stages::AnalyzeOutcome;
use crate::store::AccountStore;

const FETCH_FANOUT: usize = 4;

/// Resolves accounts the primary pass left `Undetermined`, using the full
/// timeline rather than only topic-scoped posts. Every write sets the
/// secondary marker, so re-delivered jobs are no-ops.
pub struct SecondaryStage {
    content: Arc<dyn ContentSource>,
    store: Arc<dyn AccountStore>,
    classifier: Arc<BatchClassifier>,
    limiter: FetchLimiter,
    timeline_max_items: u32,
}

impl SecondaryStage {
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

    pub async fn analyze(
        &self,
        config: &TopicConfig,
        account_id: &str,
        handle: &str,
    ) -> Result<AnalyzeOutcome> {
        if self.should_skip(account_id).await? {
            debug!(handle, "Secondary pass already done or category terminal, skipping");
            return Ok(AnalyzeOutcome::Skipped);
        }

        let content = self.fetch_content(config, account_id, handle).await?;
        let result = match content {
            FetchedContent::Empty => dormant_result(account_id, handle),
            FetchedContent::Posts(account) => {
                self.classifier
                    .classify_one(&config.secondary_prompt, account, SECONDARY_CATEGORIES)
                    .await
            }
        };

        self.persist(&result).await?;
        info!(handle, category = %result.category, "Secondary classification stored");
        Ok(AnalyzeOutcome::Classified(result.category))
    }

    /// Batch path used by the in-process fallback run.
    pub async fn analyze_many(
        &self,
        config: &TopicConfig,
        accounts: &[(String, String)],
    ) -> Result<Vec<ClassifiedAccount>> {
        let mut eligible = Vec::with_capacity(accounts.len());
        for (account_id, handle) in accounts {
            if !self.should_skip(account_id).await? {
                eligible.push((account_id.clone(), handle.clone()));
            }
        }

        let fetched: Vec<(String, String, Result<FetchedContent>)> =
            stream::iter(eligible.into_iter().map(|(account_id, handle)| {
                async move {
                    let content = self.fetch_content(config, &account_id, &handle).await;
                    (account_id, handle, content)
                }
            }))
            .buffer_unordered(FETCH_FANOUT)
            .collect()
            .await;

        let mut results = Vec::new();
        let mut to_classify = Vec::new();
        for (account_id, handle, content) in fetched {
            match content {
                Ok(FetchedContent::Empty) => results.push(dormant_result(&account_id, &handle)),
                Ok(FetchedContent::Posts(account)) => to_classify.push(account),
                Err(e) => {
                    // Tolerated per account; annotated instead of dropped.
                    warn!(handle = handle.as_str(), error = %e, "Timeline fetch failed");
                    results.push(ClassifiedAccount {
                        account_id,
                        handle,
                        category: Category::Uncategorized,
                        confidence: 0.0,
                        reasoning: Some(format!("classification failed: {e:#}")),
                    });
                }
            }
        }

        results.extend(
            self.classifier
                .classify_batch(&config.secondary_prompt, to_classify, SECONDARY_CATEGORIES)
                .await,
        );

        for result in &results {
            self.persist(result).await?;
        }
        Ok(results)
    }

    /// Skip when the secondary marker is set or the account already holds
    /// a terminal category.
    async fn should_skip(&self, account_id: &str) -> Result<bool> {
        Ok(match self.store.get_classification(account_id).await? {
            Some(c) => c.secondary_pass || c.category.is_terminal(),
            None => false,
        })
    }

    /// Fetch the full timeline; topic-scoped posts are front-loaded so the
    /// classifier sees the most relevant content first.
    async fn fetch_content(
        &self,
        config: &TopicConfig,
        account_id: &str,
        handle: &str,
    ) -> Result<FetchedContent> {
        let posts = {
            let _permit = self.limiter.acquire().await?;
            self.content
                .fetch_timeline(handle, self.timeline_max_items)
                .await?
        };

        if posts.is_empty() {
            return Ok(FetchedContent::Empty);
        }

        let mut texts: Vec<String> = filter_topic_posts(&posts, &config.keywords)
            .into_iter()
            .map(|p| p.text)
            .collect();
        for post in posts {
            if !texts.contains(&post.text) {
                texts.push(post.text);
            }
        }

        Ok(FetchedContent::Posts(AccountContent {
            account_id: account_id.to_string(),
            handle: handle.to_string(),
            posts: texts,
        }))
    }

    async fn persist(&self, result: &ClassifiedAccount) -> Result<()> {
        self.store
            .write_classification(&Classification {
                account_id: result.account_id.clone(),
                category: result.category,
                confidence: result.confidence,
                reasoning: result.reasoning.clone(),
                classified_at: Utc::now(),
                secondary_pass: true,
            })
            .await
    }
}

enum FetchedContent {
    /// Nothing on the timeline at all — the account is dormant by
    /// definition, no AI call needed.
    Empty,
    Posts(AccountContent),
}

fn dormant_result(account_id: &str, handle: &str) -> ClassifiedAccount {
    ClassifiedAccount {
        account_id: account_id.to_string(),
        handle: handle.to_string(),
        category: Category::Dormant,
        confidence: 0.9,
        reasoning: Some("no recent posts on timeline".to_string()),
    }
}
