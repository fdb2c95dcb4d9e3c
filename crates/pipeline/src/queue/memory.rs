//! In-process job queue for single-process runs and tests.
//!
//! Mirrors the PostgreSQL queue's state machine: pending jobs become due at
//! `run_at`, a claim stamps a fresh lease token and a lease deadline, and
//! acknowledgements are accepted only from the current token holder.
//! Deadlines use `tokio::time::Instant` so paused-clock tests can advance
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pixelbatch_core::job::{ImageJob, OutputDescriptor};
use pixelbatch_core::types::JobId;
use pixelbatch_db::models::job::JobCounts;
use pixelbatch_db::models::status::JobStatus;
use pixelbatch_events::{EventBus, QueueEvent};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use super::{ClaimedJob, FailOutcome, JobQueue, QueueError, QueueSettings, ReapSummary};
use super::LEASE_EXPIRED_REASON;

struct Entry {
    job: ImageJob,
    status: JobStatus,
    attempts: i32,
    max_attempts: i32,
    token: Option<Uuid>,
    run_at: Instant,
    lease_expires_at: Option<Instant>,
}

impl Entry {
    fn holds(&self, token: Uuid) -> bool {
        self.status == JobStatus::Running && self.token == Some(token)
    }
}

#[derive(Default)]
struct State {
    /// Keyed by id so iteration order is submission order.
    jobs: BTreeMap<JobId, Entry>,
    next_id: JobId,
}

/// Job queue held entirely in process memory.
pub struct MemoryQueue {
    state: Mutex<State>,
    bus: Arc<EventBus>,
    settings: QueueSettings,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self::with_bus(Arc::new(EventBus::default()), settings)
    }

    /// Publish lifecycle events on an existing bus.
    pub fn with_bus(bus: Arc<EventBus>, settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(State::default()),
            bus,
            settings,
        }
    }

    /// Current status of a job, if it exists.
    pub async fn status(&self, id: JobId) -> Option<JobStatus> {
        self.state.lock().await.jobs.get(&id).map(|e| e.status)
    }
}

fn wall_clock_after(delay: Duration) -> pixelbatch_core::types::Timestamp {
    Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64)
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(&self, job: ImageJob) -> Result<JobId, QueueError> {
        job.validate()?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(
            id,
            Entry {
                job,
                status: JobStatus::Pending,
                attempts: 0,
                max_attempts: self.settings.retry.max_attempts as i32,
                token: None,
                run_at: Instant::now(),
                lease_expires_at: None,
            },
        );
        Ok(id)
    }

    async fn claim(&self, worker: &str) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let due = state
            .jobs
            .iter()
            .filter(|(_, e)| e.status == JobStatus::Pending && e.run_at <= now)
            .min_by_key(|(id, e)| (e.run_at, **id))
            .map(|(id, _)| *id);
        let Some(id) = due else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        entry.status = JobStatus::Running;
        entry.attempts += 1;
        entry.token = Some(token);
        entry.lease_expires_at = Some(now + self.settings.lease);

        tracing::trace!(job_id = id, worker, attempts = entry.attempts, "Job claimed");
        Ok(Some(ClaimedJob {
            id,
            job: entry.job.clone(),
            attempts: entry.attempts,
            max_attempts: entry.max_attempts,
            token,
        }))
    }

    async fn complete(
        &self,
        claim: &ClaimedJob,
        output: &OutputDescriptor,
    ) -> Result<bool, QueueError> {
        {
            let mut state = self.state.lock().await;
            let Some(entry) = state.jobs.get_mut(&claim.id).filter(|e| e.holds(claim.token))
            else {
                return Ok(false);
            };
            entry.status = JobStatus::Completed;
            entry.token = None;
            entry.lease_expires_at = None;
        }
        self.bus
            .publish(QueueEvent::completed(claim.id, claim.job.clone(), output.clone()));
        Ok(true)
    }

    async fn fail(&self, claim: &ClaimedJob, reason: &str) -> Result<FailOutcome, QueueError> {
        let policy = &self.settings.retry;
        let outcome = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.jobs.get_mut(&claim.id).filter(|e| e.holds(claim.token))
            else {
                return Ok(FailOutcome::LeaseLost);
            };
            entry.token = None;
            entry.lease_expires_at = None;

            if policy.should_retry(entry.attempts.max(0) as u32) {
                let delay = policy.delay_for_attempt(entry.attempts.max(1) as u32);
                entry.status = JobStatus::Pending;
                entry.run_at = Instant::now() + delay;
                FailOutcome::Retrying {
                    attempts: entry.attempts,
                    run_at: wall_clock_after(delay),
                }
            } else {
                entry.status = JobStatus::Failed;
                FailOutcome::Exhausted {
                    attempts: entry.attempts,
                }
            }
        };

        let (attempts, will_retry) = match outcome {
            FailOutcome::Retrying { attempts, .. } => (attempts, true),
            FailOutcome::Exhausted { attempts } => (attempts, false),
            FailOutcome::LeaseLost => return Ok(outcome),
        };
        self.bus.publish(QueueEvent::failed(
            claim.id,
            claim.job.clone(),
            reason,
            attempts,
            will_retry,
        ));
        Ok(outcome)
    }

    async fn reap_expired(&self) -> Result<ReapSummary, QueueError> {
        let now = Instant::now();
        let mut summary = ReapSummary::default();
        let mut failed = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (id, entry) in state.jobs.iter_mut() {
                let expired = entry.status == JobStatus::Running
                    && entry.lease_expires_at.is_some_and(|at| at < now);
                if !expired {
                    continue;
                }
                entry.token = None;
                entry.lease_expires_at = None;
                if entry.attempts >= entry.max_attempts {
                    entry.status = JobStatus::Failed;
                    failed.push((*id, entry.job.clone(), entry.attempts));
                } else {
                    entry.status = JobStatus::Pending;
                    entry.run_at = now;
                    summary.requeued += 1;
                }
            }
        }

        summary.failed = failed.len() as u64;
        for (id, job, attempts) in failed {
            self.bus.publish(QueueEvent::failed(
                id,
                job,
                LEASE_EXPIRED_REASON,
                attempts,
                false,
            ));
        }
        Ok(summary)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.bus.subscribe()
    }

    async fn request_counts(&self, request_id: &str) -> Result<JobCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for entry in state.jobs.values().filter(|e| e.job.request_id == request_id) {
            match entry.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pixelbatch_core::retry::RetryPolicy;

    use super::*;

    fn settings(max_attempts: u32) -> QueueSettings {
        QueueSettings {
            retry: RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_initial_delay(Duration::from_secs(1)),
            lease: Duration::from_secs(30),
        }
    }

    fn job(item: &str) -> ImageJob {
        ImageJob::new(format!("https://x/{item}.png"), "r1", "g1").with_item_id(item)
    }

    fn output(job: &ImageJob) -> OutputDescriptor {
        OutputDescriptor::for_job(job, "/out/x.jpg")
    }

    #[tokio::test]
    async fn claims_in_submission_order_and_exclusively() {
        let queue = MemoryQueue::new(settings(3));
        let a = queue.submit(job("a")).await.unwrap();
        let b = queue.submit(job("b")).await.unwrap();

        let first = queue.claim("w1").await.unwrap().unwrap();
        let second = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!((first.id, second.id), (a, b));
        assert_eq!(first.attempts, 1);
        assert!(queue.claim("w3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_job() {
        let queue = MemoryQueue::new(settings(3));
        let err = queue
            .submit(ImageJob::new("ftp://x/a.png", "r1", "g1"))
            .await
            .unwrap_err();
        assert_matches!(err, QueueError::Validation(_));
    }

    #[tokio::test]
    async fn complete_publishes_event_once() {
        let queue = MemoryQueue::new(settings(3));
        let mut rx = queue.subscribe();
        queue.submit(job("a")).await.unwrap();
        let claim = queue.claim("w1").await.unwrap().unwrap();

        assert!(queue.complete(&claim, &output(&claim.job)).await.unwrap());
        assert!(!queue.complete(&claim, &output(&claim.job)).await.unwrap());

        assert_matches!(rx.recv().await.unwrap(), QueueEvent::Completed { job_id, .. } if job_id == claim.id);
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.status(claim.id).await, Some(JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_is_retried_after_backoff() {
        let queue = MemoryQueue::new(settings(3));
        queue.submit(job("a")).await.unwrap();
        let claim = queue.claim("w1").await.unwrap().unwrap();

        let outcome = queue.fail(&claim, "decode error").await.unwrap();
        assert_matches!(outcome, FailOutcome::Retrying { attempts: 1, .. });
        assert!(queue.claim("w1").await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1001)).await;
        let retry = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(retry.id, claim.id);
        assert_eq!(retry.attempts, 2);
    }

    #[tokio::test]
    async fn final_failure_is_terminal() {
        let queue = MemoryQueue::new(settings(1));
        let mut rx = queue.subscribe();
        queue.submit(job("a")).await.unwrap();
        let claim = queue.claim("w1").await.unwrap().unwrap();

        let outcome = queue.fail(&claim, "404").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 1 });
        assert_matches!(
            rx.recv().await.unwrap(),
            QueueEvent::Failed { will_retry: false, ref reason, .. } if reason == "404"
        );
        assert_eq!(queue.status(claim.id).await, Some(JobStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_and_old_holder_rejected() {
        let queue = MemoryQueue::new(settings(3));
        let mut rx = queue.subscribe();
        queue.submit(job("a")).await.unwrap();
        let stale = queue.claim("w1").await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let reaped = queue.reap_expired().await.unwrap();
        assert_eq!(reaped, ReapSummary { requeued: 1, failed: 0 });

        let fresh = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(fresh.id, stale.id);
        assert_ne!(fresh.token, stale.token);

        assert!(!queue.complete(&stale, &output(&stale.job)).await.unwrap());
        assert_eq!(queue.fail(&stale, "late").await.unwrap(), FailOutcome::LeaseLost);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_final_attempt_fails_job() {
        let queue = MemoryQueue::new(settings(1));
        let mut rx = queue.subscribe();
        queue.submit(job("a")).await.unwrap();
        let claim = queue.claim("w1").await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let reaped = queue.reap_expired().await.unwrap();
        assert_eq!(reaped, ReapSummary { requeued: 0, failed: 1 });
        assert_matches!(
            rx.recv().await.unwrap(),
            QueueEvent::Failed { job_id, reason, will_retry: false, .. }
                if job_id == claim.id && reason == LEASE_EXPIRED_REASON
        );
    }

    #[tokio::test]
    async fn counts_by_status_for_request() {
        let queue = MemoryQueue::new(settings(1));
        queue.submit(job("a")).await.unwrap();
        queue.submit(job("b")).await.unwrap();
        queue.submit(job("c")).await.unwrap();
        queue
            .submit(ImageJob::new("https://x/z.png", "other", "g1"))
            .await
            .unwrap();

        let a = queue.claim("w").await.unwrap().unwrap();
        queue.complete(&a, &output(&a.job)).await.unwrap();
        let b = queue.claim("w").await.unwrap().unwrap();
        queue.fail(&b, "bad").await.unwrap();
        queue.claim("w").await.unwrap().unwrap();

        let counts = queue.request_counts("r1").await.unwrap();
        assert_eq!(
            counts,
            JobCounts {
                pending: 0,
                running: 1,
                completed: 1,
                failed: 1,
            }
        );
        assert_eq!(counts.total(), 3);
    }
}
