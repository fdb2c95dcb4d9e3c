//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pixelbatch_core::batch::FailurePolicy;
use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_events::WebhookConfig;
use pixelbatch_pipeline::QueueSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be set when STORE_BACKEND={backend}")]
    Missing {
        var: &'static str,
        backend: &'static str,
    },

    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where queue, tracker and dead-letter state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Shared PostgreSQL database; safe for many worker processes.
    Postgres,
    /// Process memory; for single-process embedding and tests.
    Memory,
}

impl StoreBackend {
    pub fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            _ => Err("must be one of: postgres, memory".into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err("must be one of: text, json".into()),
        }
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Number of concurrent worker loops.
    pub concurrency: usize,
    /// Name stamped on claimed jobs.
    pub worker_name: String,
    /// Idle wait between queue polls.
    pub poll_interval: Duration,
    /// How long a claim stays valid.
    pub lease: Duration,
    /// How often expired leases are reaped.
    pub reaper_interval: Duration,
    /// Transform attempts per job, including the first.
    pub max_attempts: u32,
    /// Bound on one source download.
    pub fetch_timeout: Duration,
    pub webhook_url: String,
    pub webhook_timeout: Duration,
    pub output_dir: PathBuf,
    pub output_base_url: Option<String>,
    pub jpeg_quality: u8,
    pub failure_policy: FailurePolicy,
    /// How often the dead-letter sweeper runs.
    pub dead_letter_interval: Duration,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                         |
    /// |-----------------------------|---------------------------------|
    /// | `STORE_BACKEND`             | `postgres`                      |
    /// | `DATABASE_URL`              | required for `postgres`         |
    /// | `DB_MAX_CONNECTIONS`        | `10`                            |
    /// | `WORKER_CONCURRENCY`        | `4`                             |
    /// | `WORKER_NAME`               | `worker-{pid}`                  |
    /// | `POLL_INTERVAL_MS`          | `500`                           |
    /// | `LEASE_SECS`                | `300`                           |
    /// | `REAPER_INTERVAL_SECS`      | `30`                            |
    /// | `MAX_ATTEMPTS`              | `3`                             |
    /// | `FETCH_TIMEOUT_SECS`        | `30`                            |
    /// | `WEBHOOK_URL`               | `http://localhost:3000/webhook` |
    /// | `WEBHOOK_TIMEOUT_SECS`      | `10`                            |
    /// | `OUTPUT_DIR`                | `./output_images`               |
    /// | `OUTPUT_BASE_URL`           | unset                           |
    /// | `JPEG_QUALITY`              | `50`                            |
    /// | `FAILURE_POLICY`            | `strict`                        |
    /// | `DEAD_LETTER_INTERVAL_SECS` | `60`                            |
    /// | `LOG_FORMAT`                | `text`                          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let store_backend: StoreBackend = parse(&get, "STORE_BACKEND", StoreBackend::Postgres)?;
        let database_url = get("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing {
                var: "DATABASE_URL",
                backend: store_backend.name(),
            });
        }

        let concurrency: usize = parse(&get, "WORKER_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_CONCURRENCY",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let jpeg_quality: u8 = parse(&get, "JPEG_QUALITY", 50)?;
        if !(1..=100).contains(&jpeg_quality) {
            return Err(ConfigError::Invalid {
                var: "JPEG_QUALITY",
                value: jpeg_quality.to_string(),
                reason: "must be between 1 and 100".into(),
            });
        }

        let failure_policy: FailurePolicy =
            parse(&get, "FAILURE_POLICY", FailurePolicy::default())?;

        Ok(Self {
            store_backend,
            database_url,
            db_max_connections: parse(&get, "DB_MAX_CONNECTIONS", 10)?,
            concurrency,
            worker_name: get("WORKER_NAME")
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            poll_interval: Duration::from_millis(parse(&get, "POLL_INTERVAL_MS", 500)?),
            lease: Duration::from_secs(parse(&get, "LEASE_SECS", 300)?),
            reaper_interval: Duration::from_secs(parse(&get, "REAPER_INTERVAL_SECS", 30)?),
            max_attempts: parse(&get, "MAX_ATTEMPTS", 3)?,
            fetch_timeout: Duration::from_secs(parse(&get, "FETCH_TIMEOUT_SECS", 30)?),
            webhook_url: get("WEBHOOK_URL")
                .unwrap_or_else(|| "http://localhost:3000/webhook".into()),
            webhook_timeout: Duration::from_secs(parse(&get, "WEBHOOK_TIMEOUT_SECS", 10)?),
            output_dir: get("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output_images")),
            output_base_url: get("OUTPUT_BASE_URL"),
            jpeg_quality,
            failure_policy,
            dead_letter_interval: Duration::from_secs(parse(
                &get,
                "DEAD_LETTER_INTERVAL_SECS",
                60,
            )?),
            log_format: parse(&get, "LOG_FORMAT", LogFormat::Text)?,
        })
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            retry: RetryPolicy::default().with_max_attempts(self.max_attempts),
            lease: self.lease,
        }
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig::new(&self.webhook_url).with_request_timeout(self.webhook_timeout)
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
