//! Completion aggregation.
//!
//! [`CompletionAggregator`] consumes [`QueueEvent`]s, records each terminal
//! outcome in the [`BatchTracker`], and dispatches a group when its record
//! call returned the closing count. Tracker writes that fail on storage
//! errors are retried with backoff rather than dropped, since a lost
//! completion would leave its group open forever. Dispatch is never
//! repeated here; [`WebhookDispatcher`] retries its own storage steps.
//!
//! Events reach the aggregator over a bounded broadcast channel. If the
//! aggregator falls behind by more than the channel capacity, the oldest
//! events are overwritten and never recorded: the affected groups stay
//! open (visible in the status report) until their jobs are resubmitted.
//! The lag is logged with the number of events skipped and the job ids
//! on either side of the gap.

use std::sync::Arc;

use pixelbatch_core::batch::{FailurePolicy, GroupKey, Progress, RecordOutcome};
use pixelbatch_core::job_events::{EVENT_JOB_COMPLETED, EVENT_JOB_FAILED};
use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_core::types::JobId;
use pixelbatch_events::QueueEvent;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{DispatchError, DispatchOutcome, WebhookDispatcher};
use crate::retry::retry_transient;
use crate::tracker::{BatchTracker, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What one event did to its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// Counted; the group is still open.
    Recorded(Progress),
    /// This job was already recorded; nothing changed.
    Duplicate(Progress),
    /// Counted and closed the group, which was then dispatched.
    Dispatched(DispatchOutcome),
    /// A failed attempt that the queue will retry; not recorded.
    AwaitingRetry,
    /// The group is unknown or already full; the event was discarded.
    Dropped,
}

pub struct CompletionAggregator {
    tracker: Arc<dyn BatchTracker>,
    dispatcher: Arc<WebhookDispatcher>,
    policy: FailurePolicy,
    write_retry: RetryPolicy,
}

impl CompletionAggregator {
    pub fn new(
        tracker: Arc<dyn BatchTracker>,
        dispatcher: Arc<WebhookDispatcher>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            tracker,
            dispatcher,
            policy,
            write_retry: RetryPolicy::default().with_max_attempts(5),
        }
    }

    /// Backoff for tracker writes that hit a storage error.
    pub fn with_write_retry(mut self, retry: RetryPolicy) -> Self {
        self.write_retry = retry;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Apply one queue event.
    pub async fn handle(&self, event: &QueueEvent) -> Result<AggregateOutcome, AggregateError> {
        let key = event.group_key();
        let key_ref = &key;
        let recorded = match event {
            QueueEvent::Completed { job_id, output, .. } => {
                tracing::debug!(event = EVENT_JOB_COMPLETED, job_id, group = %key, "Recording completion");
                let (tracker, job_id) = (&self.tracker, *job_id);
                retry_transient(
                    &self.write_retry,
                    &key,
                    "record completion",
                    TrackerError::is_transient,
                    move || tracker.record_completion(key_ref, job_id, output),
                )
                .await
            }
            QueueEvent::Failed {
                job_id,
                reason,
                attempts,
                will_retry: true,
                ..
            } => {
                tracing::warn!(
                    event = EVENT_JOB_FAILED,
                    job_id,
                    group = %key,
                    attempts,
                    reason = %reason,
                    "Job attempt failed, queue will retry",
                );
                return Ok(AggregateOutcome::AwaitingRetry);
            }
            QueueEvent::Failed {
                job_id,
                reason,
                attempts,
                ..
            } => {
                tracing::error!(
                    event = EVENT_JOB_FAILED,
                    job_id,
                    group = %key,
                    attempts,
                    reason = %reason,
                    "Job failed permanently",
                );
                let (tracker, job_id) = (&self.tracker, *job_id);
                retry_transient(
                    &self.write_retry,
                    &key,
                    "record failure",
                    TrackerError::is_transient,
                    move || tracker.record_failure(key_ref, job_id, reason),
                )
                .await
            }
        };

        let outcome = match recorded {
            Ok(outcome) => outcome,
            Err(TrackerError::UnknownGroup(_)) => {
                tracing::warn!(
                    job_id = event.job_id(),
                    group = %key,
                    "Event for unknown or already dispatched group dropped",
                );
                return Ok(AggregateOutcome::Dropped);
            }
            Err(e @ TrackerError::Overflow { .. }) => {
                tracing::error!(job_id = event.job_id(), error = %e, "Event exceeds expected count");
                return Ok(AggregateOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        };

        self.after_record(&key, outcome).await
    }

    async fn after_record(
        &self,
        key: &GroupKey,
        outcome: RecordOutcome,
    ) -> Result<AggregateOutcome, AggregateError> {
        if !outcome.newly_counted {
            tracing::debug!(group = %key, "Duplicate event ignored");
            return Ok(AggregateOutcome::Duplicate(outcome.progress));
        }
        if !outcome.closes_group(self.policy) {
            if self.policy == FailurePolicy::Strict
                && outcome.progress.is_full()
                && outcome.progress.failed > 0
            {
                tracing::warn!(
                    group = %key,
                    completed = outcome.progress.completed,
                    failed = outcome.progress.failed,
                    "Group settled with failures and will not be dispatched",
                );
            }
            return Ok(AggregateOutcome::Recorded(outcome.progress));
        }

        let dispatched = self.dispatcher.dispatch(key).await?;
        Ok(AggregateOutcome::Dispatched(dispatched))
    }

    /// Consume events until `cancel` fires or the bus closes.
    ///
    /// Each event is handled on its own task so a slow webhook does not
    /// hold up other groups. On cancellation, events already buffered in
    /// the receiver are still handled, and every in-flight task is awaited.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<QueueEvent>,
        cancel: CancellationToken,
    ) {
        let mut tasks = JoinSet::new();
        let mut lag = LagWindow::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => {
                        lag.seen(&event);
                        self.spawn_handle(&mut tasks, event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => lag.lagged(skipped),
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, aggregator shutting down");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        loop {
            match receiver.try_recv() {
                Ok(event) => {
                    lag.seen(&event);
                    self.spawn_handle(&mut tasks, event);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => lag.lagged(skipped),
                Err(_) => break,
            }
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        tracing::info!("Aggregator stopped");
    }

    fn spawn_handle(self: &Arc<Self>, tasks: &mut JoinSet<()>, event: QueueEvent) {
        let this = Arc::clone(self);
        tasks.spawn(async move {
            if let Err(e) = this.handle(&event).await {
                tracing::error!(
                    job_id = event.job_id(),
                    group = %event.group_key(),
                    error = %e,
                    "Failed to aggregate queue event",
                );
            }
        });
    }
}

/// Events overwritten in the channel, bounded by the last job id handled
/// before the gap and the first one handled after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LostWindow {
    skipped: u64,
    after_job_id: Option<JobId>,
    before_job_id: JobId,
}

/// Remembers the job ids around a receiver lag so the gap can be reported.
#[derive(Debug, Default)]
struct LagWindow {
    last_seen: Option<JobId>,
    skipped: u64,
}

impl LagWindow {
    fn lagged(&mut self, skipped: u64) {
        tracing::error!(
            skipped,
            after_job_id = ?self.last_seen,
            "Aggregator lagged, completion events were lost",
        );
        self.skipped += skipped;
    }

    fn seen(&mut self, event: &QueueEvent) -> Option<LostWindow> {
        let job_id = event.job_id();
        let lost = (self.skipped > 0).then(|| LostWindow {
            skipped: self.skipped,
            after_job_id: self.last_seen,
            before_job_id: job_id,
        });
        if let Some(window) = &lost {
            tracing::error!(
                skipped = window.skipped,
                after_job_id = ?window.after_job_id,
                before_job_id = window.before_job_id,
                "Events between these jobs were never recorded; their groups stay open",
            );
        }
        self.skipped = 0;
        self.last_seen = Some(job_id);
        lost
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Aggregator task panicked");
    }
}
