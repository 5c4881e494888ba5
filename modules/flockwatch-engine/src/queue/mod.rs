//! Durable queue facade.
//!
//! The broker behind `JobQueue` is an external collaborator; the engine
//! only depends on this trait. `PgQueue` is the Postgres-backed
//! implementation; an in-memory queue for tests lives in `crate::testing`.

pub mod pg;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flockwatch_common::{Job, Stage};

pub use pg::PgQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker cannot be reached (connection-refused class errors).
    /// Callers switch to the in-process fallback path on this variant.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue error: {0}")]
    Other(String),
}

/// Lifecycle state of a job as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Per-stage job processor. A handler error marks the job failed; retry
/// policy beyond that is the broker's concern.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for a stage. Returns the job id.
    async fn enqueue(&self, stage: Stage, payload: serde_json::Value) -> Result<Uuid, QueueError>;

    /// Start a bounded worker pool consuming one stage. The returned
    /// handles run until aborted.
    async fn consume(
        &self,
        stage: Stage,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Vec<JoinHandle<()>>, QueueError>;

    async fn counts(&self, stage: Stage) -> Result<QueueCounts, QueueError>;

    async fn job_state(&self, id: Uuid) -> Result<Option<JobState>, QueueError>;
}
