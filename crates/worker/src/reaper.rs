//! Periodic maintenance loops: lease reaping and dead-letter redelivery.

use std::sync::Arc;
use std::time::Duration;

use pixelbatch_pipeline::{
    redeliver_dead_letters, DeadLetterStore, JobQueue, Notifier, RedeliveryConfig,
};
use tokio_util::sync::CancellationToken;

/// Return jobs with expired leases to the queue until cancelled.
pub async fn run_lease_reaper(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Lease reaper cancelled");
                break;
            }
            _ = ticker.tick() => match queue.reap_expired().await {
                Ok(summary) if summary.requeued > 0 || summary.failed > 0 => {
                    tracing::warn!(
                        requeued = summary.requeued,
                        failed = summary.failed,
                        "Reaped jobs with expired leases",
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Lease reaper pass failed"),
            },
        }
    }
}

/// Redeliver dead-lettered webhooks until cancelled.
pub async fn run_dead_letter_sweeper(
    store: Arc<dyn DeadLetterStore>,
    notifier: Arc<dyn Notifier>,
    config: RedeliveryConfig,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Dead-letter sweeper cancelled");
                break;
            }
            _ = ticker.tick() => {
                match redeliver_dead_letters(store.as_ref(), notifier.as_ref(), &config).await {
                    Ok(summary) if summary.claimed > 0 => tracing::info!(
                        claimed = summary.claimed,
                        delivered = summary.delivered,
                        rescheduled = summary.rescheduled,
                        "Dead-letter sweep finished",
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Dead-letter sweep failed"),
                }
            }
        }
    }
}
