//! Queued image job rows.

use pixelbatch_core::job::ImageJob;
use pixelbatch_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::status::StatusId;

/// A row from the `image_jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ImageJobRow {
    pub id: DbId,
    pub request_id: String,
    pub group_id: String,
    pub item_id: Option<String>,
    pub url: String,
    pub status_id: StatusId,
    pub attempts: i32,
    pub max_attempts: i32,
    pub claim_token: Option<Uuid>,
    pub worker_name: Option<String>,
    pub run_at: Timestamp,
    pub lease_expires_at: Option<Timestamp>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub submitted_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ImageJobRow {
    /// The payload the row was submitted with.
    pub fn payload(&self) -> ImageJob {
        ImageJob {
            url: self.url.clone(),
            request_id: self.request_id.clone(),
            group_id: self.group_id.clone(),
            item_id: self.item_id.clone(),
        }
    }
}

/// Per-status job counts for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed
    }
}
