//! Per-group completion tracking.
//!
//! A tracker entry is registered with its expected item count before any
//! of the group's jobs are enqueued. Each terminal job outcome is recorded
//! exactly once per job id, and the returned [`RecordOutcome`] tells the
//! caller whether it crossed the closing boundary. Only that caller drains
//! the entry.

use async_trait::async_trait;
use pixelbatch_core::batch::{GroupKey, GroupStatus, Progress, RecordOutcome};
use pixelbatch_core::error::CoreError;
use pixelbatch_core::job::OutputDescriptor;
use pixelbatch_core::types::JobId;

pub mod memory;
pub mod postgres;

pub use memory::MemoryTracker;
pub use postgres::PgTracker;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("Group {key} is registered with {registered} items, not {requested}")]
    ExpectedMismatch {
        key: GroupKey,
        registered: i32,
        requested: i32,
    },

    #[error("Group {0} is not registered or was already dispatched")]
    UnknownGroup(GroupKey),

    #[error("Group {key} has no room for another item ({progress:?})")]
    Overflow { key: GroupKey, progress: Progress },

    #[error("Tracker storage error: {0}")]
    Database(#[from] sqlx::Error),
}

impl TrackerError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

// ---------------------------------------------------------------------------
// BatchTracker
// ---------------------------------------------------------------------------

/// Shared aggregation state keyed by `(request_id, group_id)`.
#[async_trait]
pub trait BatchTracker: Send + Sync {
    /// Record the expected item count for a group.
    ///
    /// Re-registering with the same count is a no-op; a different count is
    /// [`TrackerError::ExpectedMismatch`].
    async fn register_group(&self, key: &GroupKey, expected: i32) -> Result<(), TrackerError>;

    /// Store `output` and increment the completed count as one atomic step.
    async fn record_completion(
        &self,
        key: &GroupKey,
        job_id: JobId,
        output: &OutputDescriptor,
    ) -> Result<RecordOutcome, TrackerError>;

    /// Record a terminal job failure and increment the failed count.
    async fn record_failure(
        &self,
        key: &GroupKey,
        job_id: JobId,
        reason: &str,
    ) -> Result<RecordOutcome, TrackerError>;

    /// Current counters of an open group.
    async fn progress(&self, key: &GroupKey) -> Result<Progress, TrackerError>;

    /// Snapshot of the outputs recorded so far.
    async fn outputs(&self, key: &GroupKey) -> Result<Vec<OutputDescriptor>, TrackerError>;

    /// Read every output and delete the entry. `None` if already drained.
    async fn drain_and_clear(
        &self,
        key: &GroupKey,
    ) -> Result<Option<Vec<OutputDescriptor>>, TrackerError>;

    /// Every open group of a request, with outputs.
    async fn request_status(&self, request_id: &str) -> Result<Vec<GroupStatus>, TrackerError>;
}
