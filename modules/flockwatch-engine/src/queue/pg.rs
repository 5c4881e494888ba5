//! Postgres-backed durable queue. Jobs are claimed with
//! `FOR UPDATE SKIP LOCKED`, so any number of worker processes can pull
//! from the same stage without double delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use flockwatch_common::{Job, Stage};

use super::{JobHandler, JobQueue, JobState, QueueCounts, QueueError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Create the jobs table if it does not exist yet. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            stage TEXT NOT NULL,
            payload JSONB NOT NULL,
            state TEXT NOT NULL DEFAULT 'waiting',
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS jobs_stage_state_idx ON jobs (stage, state, enqueued_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim the oldest waiting job for a stage, marking it active.
    async fn claim_next(&self, stage: Stage) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET state = 'active', started_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE stage = $1 AND state = 'waiting'
                ORDER BY enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, stage, payload, enqueued_at
            "#,
        )
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stage_str: String = row.get("stage");
        let stage = Stage::parse(&stage_str)
            .ok_or_else(|| QueueError::Other(format!("Unknown stage in jobs table: {stage_str}")))?;

        Ok(Some(Job {
            id: row.get("id"),
            stage,
            payload: row.get("payload"),
            enqueued_at: row.get("enqueued_at"),
        }))
    }

    async fn mark(
        &self,
        id: Uuid,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        sqlx::query("UPDATE jobs SET state = $2, finished_at = now(), error = $3 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, stage: Stage, payload: serde_json::Value) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO jobs (id, stage, payload) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(stage.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(id)
    }

    async fn consume(
        &self,
        stage: Stage,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        info!(stage = %stage, concurrency, "Starting queue consumers");

        let handles = (0..concurrency)
            .map(|worker| {
                let queue = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        match queue.claim_next(stage).await {
                            Ok(Some(job)) => {
                                let job_id = job.id;
                                match handler.handle(job).await {
                                    Ok(()) => {
                                        if let Err(e) =
                                            queue.mark(job_id, JobState::Completed, None).await
                                        {
                                            warn!(%job_id, error = %e, "Failed to mark job completed");
                                        }
                                    }
                                    Err(e) => {
                                        warn!(%job_id, stage = %stage, worker, error = %e, "Job failed");
                                        if let Err(e) = queue
                                            .mark(job_id, JobState::Failed, Some(format!("{e:#}")))
                                            .await
                                        {
                                            warn!(%job_id, error = %e, "Failed to mark job failed");
                                        }
                                    }
                                }
                            }
                            Ok(None) => sleep(queue.poll_interval).await,
                            Err(e) => {
                                // Broker hiccup; back off and keep polling.
                                warn!(stage = %stage, worker, error = %e, "Queue poll failed");
                                sleep(queue.poll_interval * 4).await;
                            }
                        }
                    }
                })
            })
            .collect();

        Ok(handles)
    }

    async fn counts(&self, stage: Stage) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE stage = $1 GROUP BY state")
            .bind(stage.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match JobState::parse(&state) {
                Some(JobState::Waiting) => counts.waiting = n as u64,
                Some(JobState::Active) => counts.active = n as u64,
                Some(JobState::Completed) => counts.completed = n as u64,
                Some(JobState::Failed) => counts.failed = n as u64,
                None => warn!(state = state.as_str(), "Unknown job state in counts"),
            }
        }
        Ok(counts)
    }

    async fn job_state(&self, id: Uuid) -> Result<Option<JobState>, QueueError> {
        let row = sqlx::query("SELECT state FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(row.and_then(|r| {
            let state: String = r.get("state");
            JobState::parse(&state)
        }))
    }
}

/// Classify sqlx failures: connectivity problems become
/// `QueueError::Unavailable` so the engine can switch to fallback mode.
fn map_sqlx_err(e: sqlx::Error) -> QueueError {
    match &e {
        sqlx::Error::Io(io) => QueueError::Unavailable(io.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            QueueError::Unavailable(e.to_string())
        }
        _ => QueueError::Other(e.to_string()),
    }
}
