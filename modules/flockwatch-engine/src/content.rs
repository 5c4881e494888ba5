//! Content source seam: keyword search and account timelines.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flockwatch_common::DiscoveredAccount;
use twitterapi_client::{Tweet, TwitterApiClient};

/// One page of keyword search results: the accounts behind the matching
/// posts, plus the cursor for the next page.
#[derive(Debug, Clone, Default)]
pub struct KeywordPage {
    pub accounts: Vec<DiscoveredAccount>,
    pub next_cursor: Option<String>,
}

/// One post from an account timeline.
#[derive(Debug, Clone)]
pub struct PostItem {
    pub text: String,
    pub posted_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Search posts matching a keyword; returns the authoring accounts.
    /// Pass the previous page's cursor to continue.
    async fn search_by_keyword(
        &self,
        keyword: &str,
        cursor: Option<&str>,
    ) -> Result<KeywordPage>;

    /// Fetch up to `max_items` recent posts from one account.
    async fn fetch_timeline(&self, handle: &str, max_items: u32) -> Result<Vec<PostItem>>;
}

// ---------------------------------------------------------------------------
// ContentSource impl for TwitterApiClient
// ---------------------------------------------------------------------------

#[async_trait]
impl ContentSource for TwitterApiClient {
    async fn search_by_keyword(
        &self,
        keyword: &str,
        cursor: Option<&str>,
    ) -> Result<KeywordPage> {
        let page = self
            .search_tweets(keyword, cursor)
            .await
            .context("Keyword search failed")?;

        let now = Utc::now();
        let mut accounts: Vec<DiscoveredAccount> = Vec::new();
        for tweet in &page.tweets {
            let Some(author) = &tweet.author else {
                continue;
            };
            let Some(handle) = author.user_name.as_deref().filter(|h| !h.is_empty()) else {
                continue;
            };
            if author.id.is_empty() {
                continue;
            }
            // One entry per author per page.
            if accounts.iter().any(|a| a.account_id == author.id) {
                continue;
            }
            accounts.push(DiscoveredAccount {
                account_id: author.id.clone(),
                handle: handle.to_string(),
                display_name: author.name.clone(),
                bio: author.description.clone(),
                followers: author.followers,
                discovered_at: now,
            });
        }

        let has_next = page.has_next_page;
        Ok(KeywordPage {
            accounts,
            next_cursor: page.next_cursor.filter(|c| !c.is_empty() && has_next),
        })
    }

    async fn fetch_timeline(&self, handle: &str, max_items: u32) -> Result<Vec<PostItem>> {
        let tweets = self
            .fetch_user_tweets(handle, max_items)
            .await
            .context("Timeline fetch failed")?;

        Ok(tweets
            .iter()
            .filter_map(|t| {
                let text = t.content()?.to_string();
                Some(PostItem {
                    text,
                    posted_at: parse_created_at(t),
                })
            })
            .collect())
    }
}

/// Parse the classic Twitter timestamp format ("Wed Oct 10 20:19:24 +0000
/// 2018"). Returns None rather than failing the whole timeline.
fn parse_created_at(tweet: &Tweet) -> Option<DateTime<Utc>> {
    let raw = tweet.created_at.as_deref()?;
    DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Keep only posts mentioning any of the topic keywords
/// (case-insensitive). The primary pass classifies from these.
pub fn filter_topic_posts(posts: &[PostItem], keywords: &[String]) -> Vec<PostItem> {
    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    posts
        .iter()
        .filter(|p| {
            let text = p.text.to_lowercase();
            lowered.iter().any(|k| text.contains(k.as_str()))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(text: &str) -> PostItem {
        PostItem {
            text: text.to_string(),
            posted_at: None,
        }
    }

    #[test]
    fn topic_filter_is_case_insensitive() {
        let posts = vec![
            post("Big news about Solar panels today"),
            post("lunch was great"),
            post("SOLAR everything"),
        ];
        let keywords = vec!["solar".to_string()];
        let filtered = filter_topic_posts(&posts, &keywords);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn topic_filter_matches_any_keyword() {
        let posts = vec![post("wind farms expanding"), post("nothing relevant")];
        let keywords = vec!["solar".to_string(), "wind".to_string()];
        let filtered = filter_topic_posts(&posts, &keywords);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].text.contains("wind"));
    }
}
