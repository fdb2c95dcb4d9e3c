//! PostgreSQL-backed job queue over [`JobRepo`].

use std::sync::Arc;

use async_trait::async_trait;
use pixelbatch_core::job::{ImageJob, OutputDescriptor};
use pixelbatch_core::types::JobId;
use pixelbatch_db::models::job::{ImageJobRow, JobCounts};
use pixelbatch_db::repositories::JobRepo;
use pixelbatch_db::DbPool;
use pixelbatch_events::{EventBus, QueueEvent};
use tokio::sync::broadcast;

use super::{ClaimedJob, FailOutcome, JobQueue, QueueError, QueueSettings, ReapSummary};
use super::LEASE_EXPIRED_REASON;

/// Job queue shared by every worker process connected to the database.
///
/// Events are published on the local [`EventBus`] of the process that
/// performed the transition, so each process aggregates the completions
/// of the jobs it ran.
pub struct PgQueue {
    pool: DbPool,
    bus: Arc<EventBus>,
    settings: QueueSettings,
}

impl PgQueue {
    pub fn new(pool: DbPool, bus: Arc<EventBus>, settings: QueueSettings) -> Self {
        Self {
            pool,
            bus,
            settings,
        }
    }

    fn to_claimed(row: ImageJobRow) -> Result<ClaimedJob, QueueError> {
        let token = row
            .claim_token
            .ok_or(QueueError::MissingClaimToken(row.id))?;
        Ok(ClaimedJob {
            id: row.id,
            job: row.payload(),
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            token,
        })
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn submit(&self, job: ImageJob) -> Result<JobId, QueueError> {
        job.validate()?;
        let max_attempts = self.settings.retry.max_attempts as i32;
        let row = JobRepo::submit(&self.pool, &job, max_attempts).await?;
        tracing::debug!(
            job_id = row.id,
            request_id = %row.request_id,
            group_id = %row.group_id,
            "Job submitted",
        );
        Ok(row.id)
    }

    async fn claim(&self, worker: &str) -> Result<Option<ClaimedJob>, QueueError> {
        JobRepo::claim_next(&self.pool, worker, self.settings.lease)
            .await?
            .map(Self::to_claimed)
            .transpose()
    }

    async fn complete(
        &self,
        claim: &ClaimedJob,
        output: &OutputDescriptor,
    ) -> Result<bool, QueueError> {
        let result = serde_json::to_value(output)?;
        let done = JobRepo::complete(&self.pool, claim.id, claim.token, &result).await?;
        if done {
            self.bus
                .publish(QueueEvent::completed(claim.id, claim.job.clone(), output.clone()));
        }
        Ok(done)
    }

    async fn fail(&self, claim: &ClaimedJob, reason: &str) -> Result<FailOutcome, QueueError> {
        let policy = &self.settings.retry;
        let attempts = claim.attempts;

        if policy.should_retry(attempts.max(0) as u32) {
            let delay = policy.delay_for_attempt(attempts.max(1) as u32);
            let Some((attempts, run_at)) =
                JobRepo::retry_later(&self.pool, claim.id, claim.token, reason, delay).await?
            else {
                return Ok(FailOutcome::LeaseLost);
            };
            self.bus.publish(QueueEvent::failed(
                claim.id,
                claim.job.clone(),
                reason,
                attempts,
                true,
            ));
            return Ok(FailOutcome::Retrying { attempts, run_at });
        }

        if !JobRepo::fail(&self.pool, claim.id, claim.token, reason).await? {
            return Ok(FailOutcome::LeaseLost);
        }
        self.bus.publish(QueueEvent::failed(
            claim.id,
            claim.job.clone(),
            reason,
            attempts,
            false,
        ));
        Ok(FailOutcome::Exhausted { attempts })
    }

    async fn reap_expired(&self) -> Result<ReapSummary, QueueError> {
        let failed = JobRepo::fail_expired(&self.pool).await?;
        for row in &failed {
            self.bus.publish(QueueEvent::failed(
                row.id,
                row.payload(),
                LEASE_EXPIRED_REASON,
                row.attempts,
                false,
            ));
        }
        let requeued = JobRepo::requeue_expired(&self.pool).await?;
        Ok(ReapSummary {
            requeued,
            failed: failed.len() as u64,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.bus.subscribe()
    }

    async fn request_counts(&self, request_id: &str) -> Result<JobCounts, QueueError> {
        Ok(JobRepo::counts_for_request(&self.pool, request_id).await?)
    }
}

