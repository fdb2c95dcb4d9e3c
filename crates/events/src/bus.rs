//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! Queue backends publish a [`QueueEvent`] on the [`EventBus`] after each
//! acknowledged state transition, and any number of observers receive it.

use chrono::{DateTime, Utc};
use pixelbatch_core::batch::GroupKey;
use pixelbatch_core::job::{ImageJob, OutputDescriptor};
use pixelbatch_core::types::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// QueueEvent
// ---------------------------------------------------------------------------

/// A job lifecycle transition acknowledged by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// The job's transform succeeded and the queue marked it completed.
    Completed {
        job_id: JobId,
        job: ImageJob,
        output: OutputDescriptor,
        timestamp: DateTime<Utc>,
    },
    /// An attempt failed. `will_retry` is `false` once attempts are
    /// exhausted and the failure is terminal.
    Failed {
        job_id: JobId,
        job: ImageJob,
        reason: String,
        attempts: i32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
}

impl QueueEvent {
    pub fn completed(job_id: JobId, job: ImageJob, output: OutputDescriptor) -> Self {
        Self::Completed {
            job_id,
            job,
            output,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        job_id: JobId,
        job: ImageJob,
        reason: impl Into<String>,
        attempts: i32,
        will_retry: bool,
    ) -> Self {
        Self::Failed {
            job_id,
            job,
            reason: reason.into(),
            attempts,
            will_retry,
            timestamp: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        match self {
            Self::Completed { job, .. } | Self::Failed { job, .. } => job.group_key(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`QueueEvent`].
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that will see it. Zero means the
    /// event was dropped.
    pub fn publish(&self, event: QueueEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                tracing::warn!(
                    job_id = event.job_id(),
                    "Queue event published with no subscribers",
                );
                0
            }
        }
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
