use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FlockwatchError {
    #[error("Search already in progress: job {job_id}")]
    SearchInProgress { job_id: Uuid },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topic configuration not found: {0}")]
    ConfigNotFound(Uuid),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
