//! Per-group webhook dispatch and dead-letter redelivery.
//!
//! [`WebhookDispatcher::dispatch`] is only called by the holder of the
//! closing [`RecordOutcome`](pixelbatch_core::batch::RecordOutcome), so a
//! group is dispatched at most once. The tracker entry is cleared only
//! after the send attempt: on success directly, on failure after the full
//! payload has been written to the dead-letter store.
//!
//! The send itself runs exactly once per call. Only the storage steps
//! around it (reading outputs, writing the dead letter, draining) are
//! retried on transient errors, and a failure after the send is returned
//! as a non-transient [`DispatchError::Drain`] so no caller repeats it.

use std::sync::Arc;
use std::time::Duration;

use pixelbatch_core::batch::GroupKey;
use pixelbatch_core::job_events::{EVENT_BATCH_DISPATCHED, EVENT_BATCH_DISPATCH_FAILED};
use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_core::types::DbId;
use pixelbatch_core::webhook::WebhookPayload;

use crate::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::notify::Notifier;
use crate::retry::retry_transient;
use crate::tracker::{BatchTracker, TrackerError};

/// Delay before the sweeper first retries a freshly dead-lettered payload.
pub const DEFAULT_DEAD_LETTER_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    /// The send attempt finished but the tracker entry could not be
    /// cleared. Repeating the dispatch would send the group again.
    #[error("Group {key} was handled ({outcome:?}) but its tracker entry could not be cleared: {source}")]
    Drain {
        key: GroupKey,
        outcome: DispatchOutcome,
        source: TrackerError,
    },
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Tracker(e) => e.is_transient(),
            Self::DeadLetter(DeadLetterError::Database(_)) => true,
            Self::DeadLetter(DeadLetterError::Payload(_)) => false,
            Self::Drain { .. } => false,
        }
    }
}

/// What happened to one group's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The consumer accepted the payload; the entry is cleared.
    Delivered { outputs: usize },
    /// Delivery failed; the payload is in the dead-letter store and the
    /// entry is cleared.
    DeadLettered { letter_id: DbId },
    /// The entry no longer exists; someone else already dispatched it.
    AlreadyDrained,
}

// ---------------------------------------------------------------------------
// WebhookDispatcher
// ---------------------------------------------------------------------------

pub struct WebhookDispatcher {
    tracker: Arc<dyn BatchTracker>,
    notifier: Arc<dyn Notifier>,
    dead_letters: Arc<dyn DeadLetterStore>,
    dead_letter_delay: Duration,
    write_retry: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(
        tracker: Arc<dyn BatchTracker>,
        notifier: Arc<dyn Notifier>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            tracker,
            notifier,
            dead_letters,
            dead_letter_delay: DEFAULT_DEAD_LETTER_DELAY,
            write_retry: RetryPolicy::default().with_max_attempts(5),
        }
    }

    pub fn with_dead_letter_delay(mut self, delay: Duration) -> Self {
        self.dead_letter_delay = delay;
        self
    }

    /// Backoff for tracker and dead-letter writes that hit a storage error.
    pub fn with_write_retry(mut self, retry: RetryPolicy) -> Self {
        self.write_retry = retry;
        self
    }

    /// Send the group's webhook once and clear its tracker entry.
    ///
    /// If writing the dead letter fails the entry is left in place and the
    /// error is returned, so the outputs are never lost.
    pub async fn dispatch(&self, key: &GroupKey) -> Result<DispatchOutcome, DispatchError> {
        let tracker = &self.tracker;
        let read = retry_transient(
            &self.write_retry,
            key,
            "read outputs",
            TrackerError::is_transient,
            move || tracker.outputs(key),
        )
        .await;
        let outputs = match read {
            Ok(outputs) => outputs,
            Err(TrackerError::UnknownGroup(_)) => return Ok(DispatchOutcome::AlreadyDrained),
            Err(e) => return Err(e.into()),
        };
        let payload = WebhookPayload::from_outputs(key, &outputs);

        let outcome = match self.notifier.notify(&payload).await {
            Ok(()) => {
                tracing::info!(
                    event = EVENT_BATCH_DISPATCHED,
                    group = %key,
                    outputs = payload.output_urls.len(),
                    "Batch webhook delivered",
                );
                DispatchOutcome::Delivered {
                    outputs: payload.output_urls.len(),
                }
            }
            Err(e) => {
                let (dead_letters, payload_ref, delay) =
                    (&self.dead_letters, &payload, self.dead_letter_delay);
                let error = e.to_string();
                let error_ref = error.as_str();
                let letter = retry_transient(
                    &self.write_retry,
                    key,
                    "record dead letter",
                    |e: &DeadLetterError| matches!(e, DeadLetterError::Database(_)),
                    move || dead_letters.record(payload_ref, error_ref, delay),
                )
                .await?;
                tracing::error!(
                    event = EVENT_BATCH_DISPATCH_FAILED,
                    group = %key,
                    letter_id = letter.id,
                    error = %e,
                    "Batch webhook failed, payload dead-lettered",
                );
                DispatchOutcome::DeadLettered {
                    letter_id: letter.id,
                }
            }
        };

        let drained = retry_transient(
            &self.write_retry,
            key,
            "drain",
            TrackerError::is_transient,
            move || tracker.drain_and_clear(key),
        )
        .await;
        match drained {
            Ok(Some(_)) => Ok(outcome),
            Ok(None) => {
                tracing::warn!(group = %key, "Tracker entry vanished before drain");
                Ok(outcome)
            }
            Err(source) => {
                tracing::error!(
                    group = %key,
                    outcome = ?outcome,
                    error = %source,
                    "Tracker entry not cleared after dispatch; it will not be sent again",
                );
                Err(DispatchError::Drain {
                    key: key.clone(),
                    outcome,
                    source,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Redelivery
// ---------------------------------------------------------------------------

/// Pacing for one dead-letter sweep.
#[derive(Debug, Clone)]
pub struct RedeliveryConfig {
    /// Maximum letters claimed per sweep.
    pub batch_size: usize,
    /// How long a claimed letter stays reserved for this sweeper.
    pub claim_lease: Duration,
    /// Backoff applied between redelivery attempts of one letter.
    pub backoff: RetryPolicy,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            claim_lease: Duration::from_secs(120),
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(3600),
                multiplier: 2.0,
            },
        }
    }
}

/// Result of one dead-letter sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliverySummary {
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
}

/// Claim due dead letters and try each once.
///
/// Delivered letters are marked and never sent again; failures are
/// rescheduled with backoff on the letter's attempt count.
pub async fn redeliver_dead_letters(
    store: &dyn DeadLetterStore,
    notifier: &dyn Notifier,
    config: &RedeliveryConfig,
) -> Result<RedeliverySummary, DeadLetterError> {
    let letters = store.claim_due(config.batch_size, config.claim_lease).await?;
    let mut summary = RedeliverySummary {
        claimed: letters.len(),
        ..Default::default()
    };

    for letter in letters {
        let key = letter.payload.group_key();
        match notifier.notify(&letter.payload).await {
            Ok(()) => {
                store.mark_delivered(letter.id).await?;
                summary.delivered += 1;
                tracing::info!(
                    event = EVENT_BATCH_DISPATCHED,
                    group = %key,
                    letter_id = letter.id,
                    attempts = letter.attempts,
                    "Dead-lettered webhook redelivered",
                );
            }
            Err(e) => {
                let delay = config
                    .backoff
                    .delay_for_attempt(letter.attempts.max(1) as u32);
                store.reschedule(letter.id, &e.to_string(), delay).await?;
                summary.rescheduled += 1;
                tracing::warn!(
                    group = %key,
                    letter_id = letter.id,
                    attempts = letter.attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Dead-letter redelivery failed",
                );
            }
        }
    }
    Ok(summary)
}
