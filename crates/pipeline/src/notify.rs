//! Outbound notification seam.

use async_trait::async_trait;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_events::{WebhookDelivery, WebhookError};

/// Sends one group's completion payload to the external consumer.
///
/// Implementations apply their own in-line retry; an `Err` means the
/// payload was not accepted after every attempt.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: &WebhookPayload) -> Result<(), WebhookError>;
}

#[async_trait]
impl Notifier for WebhookDelivery {
    async fn notify(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        self.deliver(payload).await
    }
}
