//! Ties the stages together: queue handlers for the durable path and the
//! inline run used by the fallback executor.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use flockwatch_common::{
    AnalyzePayload, Category, FlockwatchError, Job, SearchPayload, Stage, TopicConfig,
};

use crate::queue::{JobHandler, JobQueue};
use crate::stages::{AnalyzeOutcome, PrimaryStage, SearchStage, SecondaryStage};
use crate::store::ConfigStore;

pub struct Pipeline {
    queue: Arc<dyn JobQueue>,
    configs: Arc<dyn ConfigStore>,
    search: SearchStage,
    primary: PrimaryStage,
    secondary: SecondaryStage,
}

/// Outcome of one in-process fallback run.
#[derive(Debug, Default, Clone)]
pub struct InlineRunSummary {
    pub accounts_discovered: usize,
    pub primary_classified: usize,
    pub secondary_resolved: usize,
}

impl std::fmt::Display for InlineRunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "discovered {} accounts, {} primary classifications, {} secondary resolutions",
            self.accounts_discovered, self.primary_classified, self.secondary_resolved
        )
    }
}

impl Pipeline {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        configs: Arc<dyn ConfigStore>,
        search: SearchStage,
        primary: PrimaryStage,
        secondary: SecondaryStage,
    ) -> Self {
        Self {
            queue,
            configs,
            search,
            primary,
            secondary,
        }
    }

    /// Search worker body: discover accounts, enqueue one primary-analyze
    /// job per account still needing classification.
    pub async fn run_search_job(&self, payload: SearchPayload) -> Result<()> {
        let Some(config) = self.load_config(payload.config_id).await? else {
            return Ok(());
        };
        let max_pages = payload.max_pages.unwrap_or(config.default_max_pages).max(1);

        let outcome = self.search.run(&config, max_pages).await?;
        let mut enqueued = 0usize;
        for account in &outcome.new_accounts {
            let next = AnalyzePayload {
                config_id: config.id,
                account_id: account.account_id.clone(),
                handle: account.handle.clone(),
            };
            self.queue
                .enqueue(Stage::PrimaryAnalyze, serde_json::to_value(&next)?)
                .await
                .map_err(|e| anyhow!("Failed to enqueue primary-analyze job: {e}"))?;
            enqueued += 1;
        }

        info!(
            config = config.name.as_str(),
            discovered = outcome.accounts_seen,
            enqueued,
            "Search job complete"
        );
        Ok(())
    }

    /// Primary worker body: classify one account; `Undetermined` results
    /// feed the secondary stage.
    pub async fn run_primary_job(&self, payload: AnalyzePayload) -> Result<()> {
        let Some(config) = self.load_config(payload.config_id).await? else {
            return Ok(());
        };

        let outcome = self
            .primary
            .analyze(&config, &payload.account_id, &payload.handle)
            .await?;

        if outcome == AnalyzeOutcome::Classified(Category::Undetermined) {
            self.queue
                .enqueue(Stage::SecondaryAnalyze, serde_json::to_value(&payload)?)
                .await
                .map_err(|e| anyhow!("Failed to enqueue secondary-analyze job: {e}"))?;
        }
        Ok(())
    }

    /// Secondary worker body. Safe to re-deliver: the stage's own
    /// idempotency checks make duplicates no-ops.
    pub async fn run_secondary_job(&self, payload: AnalyzePayload) -> Result<()> {
        let Some(config) = self.load_config(payload.config_id).await? else {
            return Ok(());
        };

        self.secondary
            .analyze(&config, &payload.account_id, &payload.handle)
            .await?;
        Ok(())
    }

    /// Fallback-mode body: the full search → classify → secondary
    /// sequence in one logical task, no broker involved.
    pub async fn run_inline(
        &self,
        config_id: Uuid,
        max_pages: Option<u32>,
    ) -> Result<InlineRunSummary> {
        let config = self
            .load_config(config_id)
            .await?
            .ok_or(FlockwatchError::ConfigNotFound(config_id))?;
        let max_pages = max_pages.unwrap_or(config.default_max_pages).max(1);

        let outcome = self.search.run(&config, max_pages).await?;
        let discovered = outcome.accounts_seen;

        let primary_results = self
            .primary
            .analyze_many(&config, outcome.new_accounts)
            .await?;

        let unresolved: Vec<(String, String)> = primary_results
            .iter()
            .filter(|r| r.category == Category::Undetermined)
            .map(|r| (r.account_id.clone(), r.handle.clone()))
            .collect();

        let secondary_results = self.secondary.analyze_many(&config, &unresolved).await?;

        let summary = InlineRunSummary {
            accounts_discovered: discovered,
            primary_classified: primary_results.len(),
            secondary_resolved: secondary_results.len(),
        };
        info!(%config_id, "{summary}");
        Ok(summary)
    }

    /// A missing config is a data error: the job completes as skipped
    /// rather than being retried forever.
    async fn load_config(&self, config_id: Uuid) -> Result<Option<TopicConfig>> {
        let config = self.configs.get_config(config_id).await?;
        if config.is_none() {
            warn!(%config_id, "Topic configuration not found, skipping job");
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Queue handler adapters
// ---------------------------------------------------------------------------

pub struct SearchJobHandler(pub Arc<Pipeline>);

#[async_trait]
impl JobHandler for SearchJobHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        let payload: SearchPayload =
            serde_json::from_value(job.payload).context("Malformed search payload")?;
        self.0.run_search_job(payload).await
    }
}

pub struct PrimaryJobHandler(pub Arc<Pipeline>);

#[async_trait]
impl JobHandler for PrimaryJobHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        let payload: AnalyzePayload =
            serde_json::from_value(job.payload).context("Malformed analyze payload")?;
        self.0.run_primary_job(payload).await
    }
}

pub struct SecondaryJobHandler(pub Arc<Pipeline>);

#[async_trait]
impl JobHandler for SecondaryJobHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        let payload: AnalyzePayload =
            serde_json::from_value(job.payload).context("Malformed analyze payload")?;
        self.0.run_secondary_job(payload).await
    }
}
