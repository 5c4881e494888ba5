use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ai_gateway::{
    AiProvider, AnthropicProvider, OpenAiProvider, OpenRouterProvider, ProviderRouter,
};
use flockwatch_common::{Config, Stage};
use flockwatch_engine::classifier::{BatchClassifier, ClassifierConfig};
use flockwatch_engine::content::ContentSource;
use flockwatch_engine::limiter::FetchLimiter;
use flockwatch_engine::pipeline::{
    Pipeline, PrimaryJobHandler, SearchJobHandler, SecondaryJobHandler,
};
use flockwatch_engine::queue::{self, JobQueue, PgQueue};
use flockwatch_engine::stages::{PrimaryStage, SearchStage, SecondaryStage};
use flockwatch_engine::store::{self, PgStore};
use twitterapi_client::TwitterApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("flockwatch=info".parse()?))
        .init();

    info!("Flockwatch engine starting...");

    let config = Config::from_env();
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    queue::pg::migrate(&pool).await?;
    store::pg::migrate(&pool).await?;

    // Providers in priority order; a missing key skips the provider.
    let mut providers: Vec<Arc<dyn AiProvider>> = Vec::new();
    if config.anthropic_api_key.is_empty() {
        warn!("ANTHROPIC_API_KEY not set, skipping Anthropic provider");
    } else {
        providers.push(Arc::new(AnthropicProvider::new(
            &config.anthropic_api_key,
            vec![
                "claude-sonnet-4-5".to_string(),
                "claude-haiku-4-5".to_string(),
            ],
        )));
    }
    if config.openai_api_key.is_empty() {
        warn!("OPENAI_API_KEY not set, skipping OpenAI provider");
    } else {
        providers.push(Arc::new(OpenAiProvider::new(
            &config.openai_api_key,
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
        )));
    }
    if config.openrouter_api_key.is_empty() {
        warn!("OPENROUTER_API_KEY not set, skipping OpenRouter provider");
    } else {
        providers.push(Arc::new(OpenRouterProvider::new(
            &config.openrouter_api_key,
            vec!["meta-llama/llama-3.3-70b-instruct".to_string()],
        )));
    }
    if providers.is_empty() {
        bail!("At least one AI provider API key must be configured");
    }

    let router = Arc::new(ProviderRouter::new(providers));
    let classifier = Arc::new(BatchClassifier::with_config(
        router,
        ClassifierConfig {
            batch_size: config.batch_size,
            ..ClassifierConfig::default()
        },
    ));
    let limiter = FetchLimiter::new(config.fetch_concurrency);
    let content: Arc<dyn ContentSource> =
        Arc::new(TwitterApiClient::new(config.twitterapi_key.clone()));
    let store = Arc::new(PgStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgQueue::new(pool));

    let search = SearchStage::new(content.clone(), store.clone());
    let primary = PrimaryStage::new(
        content.clone(),
        store.clone(),
        classifier.clone(),
        limiter.clone(),
        config.timeline_max_items,
    );
    let secondary = SecondaryStage::new(
        content,
        store.clone(),
        classifier,
        limiter,
        config.timeline_max_items,
    );
    let pipeline = Arc::new(Pipeline::new(
        queue.clone(),
        store,
        search,
        primary,
        secondary,
    ));

    // One search at a time; analyze stages run with their own pools.
    let mut handles = Vec::new();
    handles.extend(
        queue
            .consume(Stage::Search, 1, Arc::new(SearchJobHandler(pipeline.clone())))
            .await
            .map_err(|e| anyhow!("Failed to start search workers: {e}"))?,
    );
    handles.extend(
        queue
            .consume(
                Stage::PrimaryAnalyze,
                config.analyze_concurrency,
                Arc::new(PrimaryJobHandler(pipeline.clone())),
            )
            .await
            .map_err(|e| anyhow!("Failed to start primary-analyze workers: {e}"))?,
    );
    handles.extend(
        queue
            .consume(
                Stage::SecondaryAnalyze,
                config.analyze_concurrency,
                Arc::new(SecondaryJobHandler(pipeline)),
            )
            .await
            .map_err(|e| anyhow!("Failed to start secondary-analyze workers: {e}"))?,
    );

    info!(workers = handles.len(), "Stage workers running");
    for handle in handles {
        handle.await?;
    }
    Ok(())
}
