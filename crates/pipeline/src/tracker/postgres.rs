//! PostgreSQL-backed batch tracker over [`TrackerRepo`].

use async_trait::async_trait;
use pixelbatch_core::batch::{validate_expected_count, GroupKey, GroupStatus, Progress, RecordOutcome};
use pixelbatch_core::job::OutputDescriptor;
use pixelbatch_core::types::JobId;
use pixelbatch_db::repositories::{RecordResult, TrackerRepo};
use pixelbatch_db::DbPool;

use super::{BatchTracker, TrackerError};

/// Tracker shared by every worker process connected to the database.
pub struct PgTracker {
    pool: DbPool,
}

impl PgTracker {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn into_outcome(key: &GroupKey, result: RecordResult) -> Result<RecordOutcome, TrackerError> {
    match result {
        RecordResult::Counted(progress) => Ok(RecordOutcome {
            progress,
            newly_counted: true,
        }),
        RecordResult::Duplicate(progress) => Ok(RecordOutcome {
            progress,
            newly_counted: false,
        }),
        RecordResult::Full(progress) => Err(TrackerError::Overflow {
            key: key.clone(),
            progress,
        }),
        RecordResult::UnknownGroup => Err(TrackerError::UnknownGroup(key.clone())),
    }
}

#[async_trait]
impl BatchTracker for PgTracker {
    async fn register_group(&self, key: &GroupKey, expected: i32) -> Result<(), TrackerError> {
        validate_expected_count(expected)?;
        let row = TrackerRepo::insert_if_absent(&self.pool, key, expected).await?;
        if row.expected_count != expected {
            return Err(TrackerError::ExpectedMismatch {
                key: key.clone(),
                registered: row.expected_count,
                requested: expected,
            });
        }
        Ok(())
    }

    async fn record_completion(
        &self,
        key: &GroupKey,
        job_id: JobId,
        output: &OutputDescriptor,
    ) -> Result<RecordOutcome, TrackerError> {
        let result = TrackerRepo::record_completion(&self.pool, key, job_id, output).await?;
        into_outcome(key, result)
    }

    async fn record_failure(
        &self,
        key: &GroupKey,
        job_id: JobId,
        reason: &str,
    ) -> Result<RecordOutcome, TrackerError> {
        let result = TrackerRepo::record_failure(&self.pool, key, job_id, reason).await?;
        into_outcome(key, result)
    }

    async fn progress(&self, key: &GroupKey) -> Result<Progress, TrackerError> {
        TrackerRepo::find(&self.pool, key)
            .await?
            .map(|row| row.progress())
            .ok_or_else(|| TrackerError::UnknownGroup(key.clone()))
    }

    async fn outputs(&self, key: &GroupKey) -> Result<Vec<OutputDescriptor>, TrackerError> {
        if TrackerRepo::find(&self.pool, key).await?.is_none() {
            return Err(TrackerError::UnknownGroup(key.clone()));
        }
        let rows = TrackerRepo::outputs(&self.pool, key).await?;
        Ok(rows.into_iter().map(OutputDescriptor::from).collect())
    }

    async fn drain_and_clear(
        &self,
        key: &GroupKey,
    ) -> Result<Option<Vec<OutputDescriptor>>, TrackerError> {
        let drained = TrackerRepo::drain(&self.pool, key).await?;
        Ok(drained.map(|rows| rows.into_iter().map(OutputDescriptor::from).collect()))
    }

    async fn request_status(&self, request_id: &str) -> Result<Vec<GroupStatus>, TrackerError> {
        let trackers = TrackerRepo::list_for_request(&self.pool, request_id).await?;
        let mut outputs = TrackerRepo::outputs_for_request(&self.pool, request_id).await?;

        let mut groups = Vec::with_capacity(trackers.len());
        for tracker in trackers {
            let (mine, rest): (Vec<_>, Vec<_>) = outputs
                .into_iter()
                .partition(|o| o.group_id == tracker.group_id);
            outputs = rest;
            groups.push(GroupStatus {
                group_id: tracker.group_id.clone(),
                progress: tracker.progress(),
                outputs: mine.into_iter().map(OutputDescriptor::from).collect(),
            });
        }
        Ok(groups)
    }
}
