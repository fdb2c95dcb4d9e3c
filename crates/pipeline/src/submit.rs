//! Submission boundary: register a group's expected count, then enqueue
//! its items.
//!
//! Registration always completes before the first job of the group is
//! submitted, so no completion can observe a missing expected count.

use std::collections::BTreeMap;
use std::sync::Arc;

use pixelbatch_core::batch::GroupKey;
use pixelbatch_core::job::{validate_id, ImageJob};
use pixelbatch_core::types::JobId;

use crate::queue::{JobQueue, QueueError};
use crate::tracker::{BatchTracker, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Group {0} must be registered before its jobs are enqueued")]
    GroupNotRegistered(GroupKey),

    #[error("Group {0} has no items")]
    EmptyGroup(GroupKey),
}

/// One item of a submitted group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitItem {
    pub url: String,
    pub item_id: Option<String>,
}

impl SubmitItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            item_id: None,
        }
    }

    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }
}

pub struct BatchSubmitter {
    queue: Arc<dyn JobQueue>,
    tracker: Arc<dyn BatchTracker>,
}

impl BatchSubmitter {
    pub fn new(queue: Arc<dyn JobQueue>, tracker: Arc<dyn BatchTracker>) -> Self {
        Self { queue, tracker }
    }

    /// Record the expected item count of a group.
    pub async fn register_group(&self, key: &GroupKey, expected: i32) -> Result<(), SubmitError> {
        self.tracker.register_group(key, expected).await?;
        tracing::debug!(group = %key, expected, "Group registered");
        Ok(())
    }

    /// Enqueue one job of an already-registered group.
    pub async fn enqueue(&self, job: ImageJob) -> Result<JobId, SubmitError> {
        job.validate().map_err(QueueError::from)?;
        let key = job.group_key();
        match self.tracker.progress(&key).await {
            Ok(_) => {}
            Err(TrackerError::UnknownGroup(_)) => return Err(SubmitError::GroupNotRegistered(key)),
            Err(e) => return Err(e.into()),
        }
        Ok(self.queue.submit(job).await?)
    }

    /// Register a group with `items.len()` expected items and enqueue them.
    pub async fn submit_group(
        &self,
        request_id: &str,
        group_id: &str,
        items: &[SubmitItem],
    ) -> Result<Vec<JobId>, SubmitError> {
        let key = GroupKey::new(request_id, group_id);
        if items.is_empty() {
            return Err(SubmitError::EmptyGroup(key));
        }

        // Validate everything up front so a bad row does not leave a
        // registered group that can never close.
        let jobs = items
            .iter()
            .map(|item| {
                let job = ImageJob {
                    url: item.url.clone(),
                    request_id: request_id.to_string(),
                    group_id: group_id.to_string(),
                    item_id: item.item_id.clone(),
                };
                job.validate().map(|_| job)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueError::from)?;

        let expected = i32::try_from(jobs.len()).unwrap_or(i32::MAX);
        self.register_group(&key, expected).await?;

        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.queue.submit(job).await?);
        }
        tracing::info!(group = %key, jobs = ids.len(), "Group submitted");
        Ok(ids)
    }

    /// Submit every group of a request. Groups are keyed by group id.
    pub async fn submit_request(
        &self,
        request_id: &str,
        groups: &BTreeMap<String, Vec<SubmitItem>>,
    ) -> Result<Vec<JobId>, SubmitError> {
        validate_id("request_id", request_id).map_err(QueueError::from)?;
        let mut ids = Vec::new();
        for (group_id, items) in groups {
            ids.extend(self.submit_group(request_id, group_id, items).await?);
        }
        Ok(ids)
    }
}
