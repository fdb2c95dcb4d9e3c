//! Storage backend wiring.

use std::sync::Arc;

use pixelbatch_events::EventBus;
use pixelbatch_pipeline::{
    BatchTracker, DeadLetterStore, JobQueue, MemoryDeadLetters, MemoryQueue, MemoryTracker,
    PgDeadLetters, PgQueue, PgTracker, QueueSettings,
};

use crate::config::{StoreBackend, WorkerConfig};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("DATABASE_URL is required for the postgres backend")]
    MissingDatabaseUrl,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// The three shared stores plus the bus queue events are published on.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub tracker: Arc<dyn BatchTracker>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub bus: Arc<EventBus>,
}

impl Backends {
    /// Everything in process memory.
    pub fn memory(settings: QueueSettings) -> Self {
        let bus = Arc::new(EventBus::default());
        Self {
            queue: Arc::new(MemoryQueue::with_bus(Arc::clone(&bus), settings)),
            tracker: Arc::new(MemoryTracker::new()),
            dead_letters: Arc::new(MemoryDeadLetters::new()),
            bus,
        }
    }

    /// Everything in PostgreSQL.
    pub fn postgres(pool: pixelbatch_db::DbPool, settings: QueueSettings) -> Self {
        let bus = Arc::new(EventBus::default());
        Self {
            queue: Arc::new(PgQueue::new(pool.clone(), Arc::clone(&bus), settings)),
            tracker: Arc::new(PgTracker::new(pool.clone())),
            dead_letters: Arc::new(PgDeadLetters::new(pool)),
            bus,
        }
    }

    /// Build the configured backend, connecting and migrating if needed.
    pub async fn connect(config: &WorkerConfig) -> Result<Self, BackendError> {
        match config.store_backend {
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory backend; state is lost on exit");
                Ok(Self::memory(config.queue_settings()))
            }
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or(BackendError::MissingDatabaseUrl)?;

                let pool = pixelbatch_db::create_pool(url, config.db_max_connections).await?;
                tracing::info!("Database connection pool created");

                pixelbatch_db::health_check(&pool).await?;
                tracing::info!("Database health check passed");

                pixelbatch_db::run_migrations(&pool).await?;
                tracing::info!("Database migrations applied");

                Ok(Self::postgres(pool, config.queue_settings()))
            }
        }
    }
}
