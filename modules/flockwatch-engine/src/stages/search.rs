use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use flockwatch_common::{DiscoveredAccount, TopicConfig};

use crate::content::ContentSource;
use crate::store::AccountStore;

/// How many keywords are searched concurrently. Pagination within one
/// keyword is inherently sequential (cursor chain).
const KEYWORD_CONCURRENCY: usize = 3;

pub struct SearchStage {
    content: Arc<dyn ContentSource>,
    store: Arc<dyn AccountStore>,
}

#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub pages_fetched: u32,
    pub accounts_seen: usize,
    /// Discovered accounts with no classification yet; these become
    /// primary-analyze work.
    pub new_accounts: Vec<DiscoveredAccount>,
}

impl SearchStage {
    pub fn new(content: Arc<dyn ContentSource>, store: Arc<dyn AccountStore>) -> Self {
        Self { content, store }
    }

    /// Search all of the topic's keywords up to `max_pages` pages each,
    /// persist every discovered account, and return the ones that still
    /// need classification.
    pub async fn run(&self, config: &TopicConfig, max_pages: u32) -> Result<SearchOutcome> {
        let keyword_results: Vec<(u32, Vec<DiscoveredAccount>)> =
            stream::iter(config.keywords.clone().into_iter().map(|keyword| {
                async move { self.collect_keyword(&keyword, max_pages).await }
            }))
            .buffer_unordered(KEYWORD_CONCURRENCY)
            .collect()
            .await;

        let mut outcome = SearchOutcome::default();
        let mut deduped: Vec<DiscoveredAccount> = Vec::new();
        for (pages, accounts) in keyword_results {
            outcome.pages_fetched += pages;
            for account in accounts {
                if !deduped.iter().any(|a| a.account_id == account.account_id) {
                    deduped.push(account);
                }
            }
        }
        outcome.accounts_seen = deduped.len();

        // Persist sequentially; the parallel part is the network fan-out.
        for account in deduped {
            self.store.upsert_account(&account).await?;
            if self
                .store
                .get_classification(&account.account_id)
                .await?
                .is_none()
            {
                outcome.new_accounts.push(account);
            }
        }

        info!(
            topic = config.name.as_str(),
            pages = outcome.pages_fetched,
            seen = outcome.accounts_seen,
            new = outcome.new_accounts.len(),
            "Search stage complete"
        );
        Ok(outcome)
    }

    /// Page through one keyword's results. Upstream errors end the chain
    /// early with whatever was collected — search results are best-effort.
    async fn collect_keyword(&self, keyword: &str, max_pages: u32) -> (u32, Vec<DiscoveredAccount>) {
        let mut accounts = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        while pages < max_pages {
            match self.content.search_by_keyword(keyword, cursor.as_deref()).await {
                Ok(page) => {
                    pages += 1;
                    accounts.extend(page.accounts);
                    match page.next_cursor {
                        Some(c) => cursor = Some(c),
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(keyword, error = %e, "Keyword search failed, keeping partial results");
                    break;
                }
            }
        }

        (pages, accounts)
    }
}
