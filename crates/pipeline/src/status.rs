//! Read-only status report for one request.

use pixelbatch_core::batch::GroupStatus;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_db::models::job::JobCounts;
use serde::Serialize;

use crate::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::queue::{JobQueue, QueueError};
use crate::tracker::{BatchTracker, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

/// Everything observable about a request without touching the tracker's
/// write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStatus {
    pub request_id: String,
    /// Job counts by queue status.
    pub jobs: JobCounts,
    /// Groups not yet dispatched, with their progress and outputs so far.
    pub open_groups: Vec<GroupStatus>,
    /// Groups whose webhook failed and awaits redelivery.
    pub undelivered: Vec<WebhookPayload>,
}

impl RequestStatus {
    /// No queued work, no open groups and nothing awaiting redelivery.
    pub fn is_settled(&self) -> bool {
        self.jobs.pending == 0
            && self.jobs.running == 0
            && self.open_groups.is_empty()
            && self.undelivered.is_empty()
    }
}

pub async fn request_status(
    queue: &dyn JobQueue,
    tracker: &dyn BatchTracker,
    dead_letters: &dyn DeadLetterStore,
    request_id: &str,
) -> Result<RequestStatus, StatusError> {
    let jobs = queue.request_counts(request_id).await?;
    let open_groups = tracker.request_status(request_id).await?;
    let undelivered = dead_letters
        .list_for_request(request_id)
        .await?
        .into_iter()
        .map(|letter| letter.payload)
        .collect();

    Ok(RequestStatus {
        request_id: request_id.to_string(),
        jobs,
        open_groups,
        undelivered,
    })
}
