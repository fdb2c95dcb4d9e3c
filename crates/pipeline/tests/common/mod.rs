//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pixelbatch_core::batch::{FailurePolicy, GroupKey};
use pixelbatch_core::job::{ImageJob, OutputDescriptor};
use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_core::types::JobId;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_events::{QueueEvent, WebhookError};
use pixelbatch_pipeline::{
    CompletionAggregator, MemoryDeadLetters, MemoryTracker, Notifier, WebhookDispatcher,
};

/// Notifier that records every accepted payload and rejects the first
/// `fail_first` calls with HTTP 500.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<WebhookPayload>>,
    pub calls: AtomicUsize,
    fail_first: usize,
}

impl RecordingNotifier {
    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<WebhookPayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(WebhookError::HttpStatus(500));
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// In-memory tracker, dead letters and dispatcher wired to a recording
/// notifier.
pub struct Harness {
    pub tracker: Arc<MemoryTracker>,
    pub dead_letters: Arc<MemoryDeadLetters>,
    pub notifier: Arc<RecordingNotifier>,
    pub aggregator: Arc<CompletionAggregator>,
}

impl Harness {
    pub fn new(policy: FailurePolicy) -> Self {
        Self::with_notifier(policy, RecordingNotifier::default())
    }

    pub fn with_notifier(policy: FailurePolicy, notifier: RecordingNotifier) -> Self {
        let tracker = Arc::new(MemoryTracker::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let notifier = Arc::new(notifier);
        let dispatcher = Arc::new(
            WebhookDispatcher::new(tracker.clone(), notifier.clone(), dead_letters.clone())
                .with_dead_letter_delay(Duration::ZERO)
                .with_write_retry(fast_retry()),
        );
        let aggregator = Arc::new(
            CompletionAggregator::new(tracker.clone(), dispatcher, policy)
                .with_write_retry(fast_retry()),
        );
        Self {
            tracker,
            dead_letters,
            notifier,
            aggregator,
        }
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(1))
}

pub fn group() -> GroupKey {
    GroupKey::new("req-1", "prod-1")
}

pub fn job(item: &str) -> ImageJob {
    ImageJob::new(format!("https://img.example.com/{item}.png"), "req-1", "prod-1")
        .with_item_id(item)
}

pub fn completed(job_id: JobId, item: &str) -> QueueEvent {
    let job = job(item);
    let output = OutputDescriptor::for_job(&job, format!("/out/output-{item}.jpg"));
    QueueEvent::completed(job_id, job, output)
}

pub fn failed(job_id: JobId, item: &str, will_retry: bool) -> QueueEvent {
    QueueEvent::failed(job_id, job(item), "source returned HTTP 404", 3, will_retry)
}
