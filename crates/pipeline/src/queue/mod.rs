//! At-least-once job queue contract.
//!
//! A claimed job carries a lease token. Only the holder of the current
//! token can complete or fail the job; once the lease expires the reaper
//! hands the job to another worker, and the old holder's late
//! acknowledgement is rejected as [`FailOutcome::LeaseLost`] (or `false`
//! from [`JobQueue::complete`]) without publishing an event.

use std::time::Duration;

use async_trait::async_trait;
use pixelbatch_core::error::CoreError;
use pixelbatch_core::job::{ImageJob, OutputDescriptor};
use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_core::types::{JobId, Timestamp};
use pixelbatch_db::models::job::JobCounts;
use pixelbatch_events::QueueEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

/// Default time a claim stays valid before the job is redelivered.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

pub use pixelbatch_core::job::LEASE_EXPIRED_REASON;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("Queue storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to encode job result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Claimed job {0} has no claim token")]
    MissingClaimToken(JobId),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Retry and lease settings shared by every queue backend.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Attempt budget and backoff between transform attempts.
    pub retry: RetryPolicy,
    /// How long a claim stays valid.
    pub lease: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease: DEFAULT_LEASE,
        }
    }
}

/// A job leased to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub job: ImageJob,
    /// Attempts made including this one.
    pub attempts: i32,
    pub max_attempts: i32,
    pub token: Uuid,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued; the next attempt becomes due at `run_at`.
    Retrying { attempts: i32, run_at: Timestamp },
    /// Attempts exhausted; the job is terminally failed.
    Exhausted { attempts: i32 },
    /// The caller's lease was no longer valid; nothing changed.
    LeaseLost,
}

/// Result of one lease-reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Jobs returned to pending for redelivery.
    pub requeued: u64,
    /// Jobs failed because their final attempt's lease expired.
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Durable at-least-once work queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a pending job and return its id.
    async fn submit(&self, job: ImageJob) -> Result<JobId, QueueError>;

    /// Lease the oldest due pending job to `worker`, if any.
    async fn claim(&self, worker: &str) -> Result<Option<ClaimedJob>, QueueError>;

    /// Acknowledge success. Publishes [`QueueEvent::Completed`] and returns
    /// `true`, or returns `false` if the lease was lost.
    async fn complete(
        &self,
        claim: &ClaimedJob,
        output: &OutputDescriptor,
    ) -> Result<bool, QueueError>;

    /// Acknowledge failure. Requeues with backoff while attempts remain,
    /// otherwise fails terminally. Publishes [`QueueEvent::Failed`] unless
    /// the lease was lost.
    async fn fail(&self, claim: &ClaimedJob, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Redeliver jobs whose lease expired; terminally fail those that were
    /// on their final attempt (publishing [`QueueEvent::Failed`]).
    async fn reap_expired(&self) -> Result<ReapSummary, QueueError>;

    /// Observe completion and failure events.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    /// Per-status job counts for a request.
    async fn request_counts(&self, request_id: &str) -> Result<JobCounts, QueueError>;
}
