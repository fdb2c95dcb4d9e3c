//! Completion-aggregation pipeline.
//!
//! Jobs flow `BatchSubmitter` → [`JobQueue`] → worker → [`TransformUnit`]
//! → [`QueueEvent`](pixelbatch_events::QueueEvent) → [`CompletionAggregator`]
//! → [`BatchTracker`] → (group closed) → [`WebhookDispatcher`].
//!
//! Each storage seam is a dyn-compatible trait with a PostgreSQL
//! implementation for multi-process deployments and an in-memory one for
//! single-process runs and tests.

pub mod aggregator;
pub mod dead_letter;
pub mod dispatcher;
pub mod notify;
pub mod queue;
mod retry;
pub mod status;
pub mod submit;
pub mod tracker;
pub mod transform;

pub use aggregator::{AggregateError, AggregateOutcome, CompletionAggregator};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterStore, MemoryDeadLetters, PgDeadLetters};
pub use dispatcher::{
    redeliver_dead_letters, DispatchError, DispatchOutcome, RedeliveryConfig, RedeliverySummary,
    WebhookDispatcher,
};
pub use notify::Notifier;
pub use queue::{
    ClaimedJob, FailOutcome, JobQueue, MemoryQueue, PgQueue, QueueError, QueueSettings, ReapSummary,
};
pub use status::{request_status, RequestStatus, StatusError};
pub use submit::{BatchSubmitter, SubmitError, SubmitItem};
pub use tracker::{BatchTracker, MemoryTracker, PgTracker, TrackerError};
pub use transform::{
    transcode_jpeg, LocalStorage, OutputStore, SourceFetcher, TransformError, TransformUnit,
    UrlFetcher,
};
