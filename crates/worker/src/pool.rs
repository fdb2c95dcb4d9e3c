//! The worker pool: N loops that claim, transform and acknowledge jobs.

use std::sync::Arc;
use std::time::Duration;

use pixelbatch_core::job_events::{EVENT_JOB_COMPLETED, EVENT_JOB_FAILED};
use pixelbatch_pipeline::{FailOutcome, JobQueue, QueueError, TransformUnit};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    transform: Arc<TransformUnit>,
    name: String,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        transform: Arc<TransformUnit>,
        name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            transform,
            name: name.into(),
            poll_interval,
        }
    }

    /// Start `concurrency` worker loops. Each stops after its in-flight job
    /// once `cancel` fires.
    pub fn spawn(self: &Arc<Self>, concurrency: usize, cancel: &CancellationToken) -> JoinSet<()> {
        let mut loops = JoinSet::new();
        for index in 0..concurrency {
            let pool = Arc::clone(self);
            let cancel = cancel.clone();
            let worker = format!("{}-{index}", self.name);
            loops.spawn(async move { pool.run(worker, cancel).await });
        }
        loops
    }

    /// One worker loop: on every tick, drain the queue until it is empty.
    pub async fn run(&self, worker: String, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(worker = %worker, "Worker loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    while !cancel.is_cancelled() {
                        match self.process_next(&worker).await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(e) => {
                                tracing::error!(worker = %worker, error = %e, "Queue error");
                                break;
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!(worker = %worker, "Worker loop stopped");
    }

    /// Claim and process one job. Returns `false` if none was due.
    pub async fn process_next(&self, worker: &str) -> Result<bool, QueueError> {
        let Some(claim) = self.queue.claim(worker).await? else {
            return Ok(false);
        };

        match self.transform.run(&claim.job).await {
            Ok(output) => {
                if self.queue.complete(&claim, &output).await? {
                    tracing::info!(
                        event = EVENT_JOB_COMPLETED,
                        worker,
                        job_id = claim.id,
                        request_id = %claim.job.request_id,
                        group_id = %claim.job.group_id,
                        output = %output.output_location,
                        "Job completed",
                    );
                } else {
                    tracing::warn!(
                        worker,
                        job_id = claim.id,
                        "Lease lost before completion was acknowledged",
                    );
                }
            }
            Err(e) => {
                let reason = e.to_string();
                match self.queue.fail(&claim, &reason).await? {
                    FailOutcome::Retrying { attempts, run_at } => tracing::warn!(
                        event = EVENT_JOB_FAILED,
                        worker,
                        job_id = claim.id,
                        attempts,
                        retry_at = %run_at,
                        error = %reason,
                        "Transform failed, will retry",
                    ),
                    FailOutcome::Exhausted { attempts } => tracing::error!(
                        event = EVENT_JOB_FAILED,
                        worker,
                        job_id = claim.id,
                        attempts,
                        error = %reason,
                        "Transform failed, attempts exhausted",
                    ),
                    FailOutcome::LeaseLost => tracing::warn!(
                        worker,
                        job_id = claim.id,
                        "Lease lost before failure was acknowledged",
                    ),
                }
            }
        }
        Ok(true)
    }
}
