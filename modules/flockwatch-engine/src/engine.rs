//! Collaborator-facing surface: trigger a search, query job status.
//! Callers never need to know whether the durable broker or the
//! in-process fallback served them.

use std::sync::Arc;

use tracing::warn;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use flockwatch_common::{FlockwatchError, SearchPayload, Stage};

use crate::fallback::FallbackExecutor;
use crate::queue::{JobQueue, JobState, QueueError};

#[derive(TypedBuilder)]
pub struct Engine {
    queue: Arc<dyn JobQueue>,
    fallback: Arc<FallbackExecutor>,
}

impl Engine {
    /// Enqueue a search for a topic. If the broker is unreachable the
    /// search runs in-process instead; a second trigger while that run is
    /// active fails with `SearchInProgress` carrying the active job id.
    pub async fn trigger_search(
        &self,
        config_id: Uuid,
        max_pages: Option<u32>,
    ) -> Result<Uuid, FlockwatchError> {
        let payload = serde_json::to_value(SearchPayload {
            config_id,
            max_pages,
        })
        .map_err(|e| FlockwatchError::Config(e.to_string()))?;

        match self.queue.enqueue(Stage::Search, payload).await {
            Ok(job_id) => Ok(job_id),
            Err(QueueError::Unavailable(msg)) => {
                warn!(error = msg.as_str(), "Durable queue unreachable, running search in-process");
                self.fallback.trigger(config_id, max_pages)
            }
            Err(e) => Err(FlockwatchError::QueueUnavailable(e.to_string())),
        }
    }

    /// Job status in either mode. Fallback runs are checked first — they
    /// are local and answer even while the broker is down.
    pub async fn job_status(&self, job_id: Uuid) -> Result<Option<JobState>, FlockwatchError> {
        if let Some(state) = self.fallback.status(job_id) {
            return Ok(Some(state));
        }

        match self.queue.job_state(job_id).await {
            Ok(state) => Ok(state),
            Err(QueueError::Unavailable(msg)) => {
                warn!(error = msg.as_str(), "Durable queue unreachable during status lookup");
                Ok(None)
            }
            Err(e) => Err(FlockwatchError::QueueUnavailable(e.to_string())),
        }
    }
}
