//! Webhook delivery with exponential-backoff retry.
//!
//! [`WebhookDelivery`] POSTs a JSON-encoded [`WebhookPayload`] to the
//! notification consumer. Any 2xx response is success; a non-2xx status or
//! a transport error is retried according to the configured
//! [`RetryPolicy`] before the last error is returned.

use std::time::Duration;

use pixelbatch_core::retry::RetryPolicy;
use pixelbatch_core::webhook::WebhookPayload;

/// Default HTTP request timeout for a single delivery attempt.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Endpoint and pacing for webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Notification consumer endpoint.
    pub url: String,
    /// Timeout for a single POST.
    pub request_timeout: Duration,
    /// In-line retry policy for one delivery.
    pub retry: RetryPolicy,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

/// Delivers batch completion payloads to the notification consumer.
pub struct WebhookDelivery {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDelivery {
    /// Create a delivery service with a pre-configured HTTP client.
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Deliver a payload with retry.
    ///
    /// Makes up to `retry.max_attempts` attempts, sleeping
    /// `retry.delay_for_attempt(n)` between them. Returns `Ok(())` on the
    /// first successful attempt.
    pub async fn deliver(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let url = self.config.url.as_str();
        let policy = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.try_send(payload).await {
                Ok(()) => {
                    tracing::debug!(
                        url,
                        attempt,
                        request_id = %payload.request_id,
                        product_oid = %payload.product_oid,
                        "Webhook delivered",
                    );
                    return Ok(());
                }
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        url,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Webhook delivery attempt failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        url,
                        attempts = attempt,
                        error = %e,
                        "Webhook delivery failed after all retries",
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self.client.post(&self.config.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
