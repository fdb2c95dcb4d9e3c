//! Worker process: configuration, backend wiring and the long-lived loops
//! (worker pool, completion listener, lease reaper, dead-letter sweeper).

use std::future::Future;
use std::sync::Arc;

use pixelbatch_pipeline::{
    CompletionAggregator, LocalStorage, Notifier, RedeliveryConfig, TransformError, TransformUnit,
    UrlFetcher, WebhookDispatcher,
};
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod config;
pub mod pool;
pub mod reaper;
pub mod telemetry;

pub use backend::{BackendError, Backends};
pub use config::{ConfigError, LogFormat, StoreBackend, WorkerConfig};
pub use pool::WorkerPool;

/// Build the transform unit described by `config`.
pub fn transform_unit(config: &WorkerConfig) -> Result<TransformUnit, TransformError> {
    let mut storage = LocalStorage::new(&config.output_dir);
    if let Some(base) = &config.output_base_url {
        storage = storage.with_base_url(base);
    }
    let fetcher = UrlFetcher::new(config.fetch_timeout)?;
    Ok(TransformUnit::new(Arc::new(fetcher), Arc::new(storage)).with_quality(config.jpeg_quality))
}

/// Run every service until `shutdown` resolves, then stop them in order.
///
/// The completion listener subscribes before any worker starts and is
/// stopped last, so every completion acknowledged by a worker reaches the
/// tracker.
pub async fn run_until(
    config: &WorkerConfig,
    backends: Backends,
    transform: Arc<TransformUnit>,
    notifier: Arc<dyn Notifier>,
    shutdown: impl Future<Output = ()>,
) {
    let workers_cancel = CancellationToken::new();
    let listener_cancel = CancellationToken::new();

    // --- Completion listener ---
    let dispatcher = Arc::new(WebhookDispatcher::new(
        Arc::clone(&backends.tracker),
        Arc::clone(&notifier),
        Arc::clone(&backends.dead_letters),
    ));
    let aggregator = Arc::new(CompletionAggregator::new(
        Arc::clone(&backends.tracker),
        dispatcher,
        config.failure_policy,
    ));
    let listener = tokio::spawn(aggregator.run(backends.queue.subscribe(), listener_cancel.clone()));

    // --- Worker pool ---
    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&backends.queue),
        transform,
        &config.worker_name,
        config.poll_interval,
    ));
    let mut workers = pool.spawn(config.concurrency, &workers_cancel);

    // --- Maintenance ---
    let reaper = tokio::spawn(reaper::run_lease_reaper(
        Arc::clone(&backends.queue),
        config.reaper_interval,
        workers_cancel.clone(),
    ));
    let sweeper = tokio::spawn(reaper::run_dead_letter_sweeper(
        Arc::clone(&backends.dead_letters),
        notifier,
        RedeliveryConfig::default(),
        config.dead_letter_interval,
        workers_cancel.clone(),
    ));

    tracing::info!(
        worker = %config.worker_name,
        concurrency = config.concurrency,
        backend = config.store_backend.name(),
        failure_policy = config.failure_policy.name(),
        "Worker services started",
    );

    shutdown.await;

    // Workers finish their in-flight job before the listener stops.
    workers_cancel.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Worker loop panicked");
        }
    }
    tracing::info!("Worker loops stopped");

    for (name, handle) in [("reaper", reaper), ("sweeper", sweeper)] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "Maintenance task panicked");
        }
    }

    listener_cancel.cancel();
    if let Err(e) = listener.await {
        tracing::error!(error = %e, "Completion listener panicked");
    }
    tracing::info!("Graceful shutdown complete");
}
