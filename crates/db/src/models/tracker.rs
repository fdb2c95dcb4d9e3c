//! Batch tracker rows.

use pixelbatch_core::batch::{GroupKey, Progress};
use pixelbatch_core::job::OutputDescriptor;
use pixelbatch_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `batch_trackers` table.
#[derive(Debug, Clone, FromRow)]
pub struct TrackerRow {
    pub request_id: String,
    pub group_id: String,
    pub expected_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TrackerRow {
    pub fn key(&self) -> GroupKey {
        GroupKey::new(&self.request_id, &self.group_id)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            expected: self.expected_count,
            completed: self.completed_count,
            failed: self.failed_count,
        }
    }
}

/// Counter columns returned by `UPDATE ... RETURNING`.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct CounterRow {
    pub expected_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
}

impl From<CounterRow> for Progress {
    fn from(row: CounterRow) -> Self {
        Progress {
            expected: row.expected_count,
            completed: row.completed_count,
            failed: row.failed_count,
        }
    }
}

/// A row from the `batch_tracker_outputs` table.
#[derive(Debug, Clone, FromRow)]
pub struct TrackerOutputRow {
    pub request_id: String,
    pub group_id: String,
    pub job_id: DbId,
    pub item_id: Option<String>,
    pub output_location: String,
    pub recorded_at: Timestamp,
}

impl From<TrackerOutputRow> for OutputDescriptor {
    fn from(row: TrackerOutputRow) -> Self {
        OutputDescriptor {
            request_id: row.request_id,
            group_id: row.group_id,
            item_id: row.item_id,
            output_location: row.output_location,
        }
    }
}
