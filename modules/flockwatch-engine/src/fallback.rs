//! In-process fallback execution, used when the durable broker is
//! unreachable. One search may run at a time, system-wide; the slot is a
//! mutex-guarded optional so the "already in progress" check is race-free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, info};
use uuid::Uuid;

use flockwatch_common::FlockwatchError;

use crate::pipeline::{InlineRunSummary, Pipeline};
use crate::queue::JobState;

struct ActiveRun {
    job_id: Uuid,
}

/// Recorded result of a finished (or running) in-process run, so
/// `status` keeps answering after the slot is cleared.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: JobState,
    pub summary: Option<InlineRunSummary>,
    pub error: Option<String>,
}

pub struct FallbackExecutor {
    pipeline: Arc<Pipeline>,
    slot: Mutex<Option<ActiveRun>>,
    outcomes: Mutex<HashMap<Uuid, RunOutcome>>,
}

impl FallbackExecutor {
    pub fn new(pipeline: Arc<Pipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            slot: Mutex::new(None),
            outcomes: Mutex::new(HashMap::new()),
        })
    }

    /// Start an in-process search run, or fail with the distinguished
    /// in-progress error carrying the active run's id. The check-and-set
    /// happens under one lock, so two concurrent triggers can never both
    /// start.
    pub fn trigger(
        self: &Arc<Self>,
        config_id: Uuid,
        max_pages: Option<u32>,
    ) -> Result<Uuid, FlockwatchError> {
        let job_id = {
            let mut slot = self.slot.lock().unwrap();
            if let Some(run) = slot.as_ref() {
                return Err(FlockwatchError::SearchInProgress { job_id: run.job_id });
            }
            let job_id = Uuid::new_v4();
            *slot = Some(ActiveRun { job_id });
            job_id
        };

        self.outcomes.lock().unwrap().insert(
            job_id,
            RunOutcome {
                state: JobState::Active,
                summary: None,
                error: None,
            },
        );
        info!(%job_id, %config_id, "Starting in-process fallback search");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.pipeline.run_inline(config_id, max_pages).await;

            {
                let mut outcomes = this.outcomes.lock().unwrap();
                match result {
                    Ok(summary) => {
                        info!(%job_id, "Fallback search complete: {summary}");
                        outcomes.insert(
                            job_id,
                            RunOutcome {
                                state: JobState::Completed,
                                summary: Some(summary),
                                error: None,
                            },
                        );
                    }
                    Err(e) => {
                        error!(%job_id, error = format!("{e:#}").as_str(), "Fallback search failed");
                        outcomes.insert(
                            job_id,
                            RunOutcome {
                                state: JobState::Failed,
                                summary: None,
                                error: Some(format!("{e:#}")),
                            },
                        );
                    }
                }
            }

            // Clear the slot last so a new search can start.
            *this.slot.lock().unwrap() = None;
        });

        Ok(job_id)
    }

    /// Status lookup, same contract as the durable queue's job state.
    pub fn status(&self, job_id: Uuid) -> Option<JobState> {
        self.outcomes
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|o| o.state)
    }

    pub fn outcome(&self, job_id: Uuid) -> Option<RunOutcome> {
        self.outcomes.lock().unwrap().get(&job_id).cloned()
    }
}
