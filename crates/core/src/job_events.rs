//! Event names for job and batch lifecycle log lines.
//!
//! Emitted as the `event` field on tracing records so operators can
//! filter the worker log by lifecycle stage.

/// A job finished its transform and was acknowledged by the queue.
pub const EVENT_JOB_COMPLETED: &str = "job.completed";

/// A job attempt failed (retrying or terminal).
pub const EVENT_JOB_FAILED: &str = "job.failed";

/// A group's webhook was delivered.
pub const EVENT_BATCH_DISPATCHED: &str = "batch.dispatched";

/// A group's webhook could not be delivered and was dead-lettered.
pub const EVENT_BATCH_DISPATCH_FAILED: &str = "batch.dispatch_failed";
