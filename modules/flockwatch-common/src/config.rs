use std::env;

use tracing::info;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres (queue + store)
    pub database_url: String,

    // AI providers — at least one key must be set; empty keys disable
    // the provider.
    pub anthropic_api_key: String,
    pub openai_api_key: String,
    pub openrouter_api_key: String,

    // Content API
    pub twitterapi_key: String,

    // Pipeline tunables
    pub analyze_concurrency: usize,
    pub fetch_concurrency: usize,
    pub batch_size: usize,
    pub timeline_max_items: u32,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            openrouter_api_key: env::var("OPENROUTER_API_KEY").unwrap_or_default(),
            twitterapi_key: required_env("TWITTERAPI_KEY"),
            analyze_concurrency: parsed_env("ANALYZE_CONCURRENCY", 5),
            fetch_concurrency: parsed_env("FETCH_CONCURRENCY", 4),
            batch_size: parsed_env("CLASSIFY_BATCH_SIZE", 10),
            timeline_max_items: parsed_env("TIMELINE_MAX_ITEMS", 50),
        }
    }

    /// Log the loaded configuration without leaking secrets.
    pub fn log_redacted(&self) {
        info!(
            anthropic = !self.anthropic_api_key.is_empty(),
            openai = !self.openai_api_key.is_empty(),
            openrouter = !self.openrouter_api_key.is_empty(),
            analyze_concurrency = self.analyze_concurrency,
            fetch_concurrency = self.fetch_concurrency,
            batch_size = self.batch_size,
            "Config loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a number")),
        Err(_) => default,
    }
}
