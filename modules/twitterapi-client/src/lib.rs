pub mod error;
pub mod types;

pub use error::{Result, TwitterApiError};
pub use types::{SearchPage, TimelinePage, Tweet, TweetAuthor};

const BASE_URL: &str = "https://api.twitterapi.io";

pub struct TwitterApiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TwitterApiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    /// Run one page of keyword search. Pass the previous page's
    /// `next_cursor` to continue.
    pub async fn search_tweets(&self, query: &str, cursor: Option<&str>) -> Result<SearchPage> {
        let url = format!("{}/twitter/tweet/advanced_search", self.base_url);
        let mut req = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .query(&[("query", query), ("queryType", "Latest")]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TwitterApiError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let page: SearchPage = resp.json().await?;
        tracing::debug!(query, count = page.tweets.len(), "Search page fetched");
        Ok(page)
    }

    /// Fetch one page of a user's recent tweets.
    pub async fn user_last_tweets(
        &self,
        user_name: &str,
        cursor: Option<&str>,
    ) -> Result<TimelinePage> {
        let url = format!("{}/twitter/user/last_tweets", self.base_url);
        let mut req = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .query(&[("userName", user_name)]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TwitterApiError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let page: TimelinePage = resp.json().await?;
        tracing::debug!(
            user_name,
            count = page.tweets.len(),
            "Timeline page fetched"
        );
        Ok(page)
    }

    /// Fetch up to `max_items` tweets from a user timeline, following
    /// cursors across pages.
    pub async fn fetch_user_tweets(&self, user_name: &str, max_items: u32) -> Result<Vec<Tweet>> {
        let mut tweets: Vec<Tweet> = Vec::new();
        let mut cursor: Option<String> = None;

        while (tweets.len() as u32) < max_items {
            let page = self.user_last_tweets(user_name, cursor.as_deref()).await?;
            if page.tweets.is_empty() {
                break;
            }
            tweets.extend(page.tweets);
            if !page.has_next_page {
                break;
            }
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        tweets.truncate(max_items as usize);
        tracing::info!(user_name, count = tweets.len(), "Fetched user timeline");
        Ok(tweets)
    }
}
