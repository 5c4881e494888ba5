//! Persistence seams.
//!
//! The dashboard's CRUD layer owns the wider schema; the pipeline only
//! needs these two traits. Mock implementations for deterministic tests
//! live in `crate::testing`.

pub mod pg;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use flockwatch_common::{Classification, DiscoveredAccount, TopicConfig};

pub use pg::PgStore;

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert or refresh a discovered account, keyed by its stable
    /// external id. The original discovery timestamp is preserved.
    async fn upsert_account(&self, account: &DiscoveredAccount) -> Result<()>;

    async fn get_account(&self, account_id: &str) -> Result<Option<DiscoveredAccount>>;

    async fn get_classification(&self, account_id: &str) -> Result<Option<Classification>>;

    async fn write_classification(&self, classification: &Classification) -> Result<()>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, id: Uuid) -> Result<Option<TopicConfig>>;
}
