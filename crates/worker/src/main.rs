use std::sync::Arc;

use pixelbatch_events::WebhookDelivery;
use pixelbatch_worker::{telemetry, Backends, StoreBackend, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    telemetry::init(config.log_format)?;
    tracing::info!(
        worker = %config.worker_name,
        backend = config.store_backend.name(),
        webhook_url = %config.webhook_url,
        output_dir = %config.output_dir.display(),
        "Loaded worker configuration",
    );
    if config.store_backend == StoreBackend::Memory {
        tracing::warn!("No other process can submit to an in-memory queue");
    }

    // --- Backends ---
    let backends = Backends::connect(&config).await?;

    // --- Transform and webhook ---
    let transform = Arc::new(pixelbatch_worker::transform_unit(&config)?);
    let notifier = Arc::new(WebhookDelivery::new(config.webhook_config())?);

    pixelbatch_worker::run_until(&config, backends, transform, notifier, shutdown_signal()).await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
