//! Durable store for webhook payloads that could not be delivered.
//!
//! A letter is written before the group's tracker entry is cleared, so
//! the aggregated outputs always live in exactly one place. The sweeper
//! claims due letters (pending, or delivering with an expired claim),
//! attempts redelivery and marks each delivered or reschedules it.

use std::time::Duration;

use async_trait::async_trait;
use pixelbatch_core::types::DbId;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_db::models::dead_letter::DeadLetterRow;

pub mod memory;
pub mod postgres;

pub use memory::MemoryDeadLetters;
pub use postgres::PgDeadLetters;

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Dead-letter storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Dead-letter payload could not be encoded or decoded: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One undelivered webhook body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: DbId,
    pub payload: WebhookPayload,
    /// Redelivery attempts claimed so far.
    pub attempts: i32,
    pub last_error: Option<String>,
}

impl TryFrom<DeadLetterRow> for DeadLetter {
    type Error = serde_json::Error;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            payload: row.webhook_payload()?,
            id: row.id,
            attempts: row.attempts,
            last_error: row.last_error,
        })
    }
}

/// Storage for undelivered webhook payloads.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persist `payload`, due for redelivery after `delay`. A second record
    /// for the same group replaces the first.
    async fn record(
        &self,
        payload: &WebhookPayload,
        error: &str,
        delay: Duration,
    ) -> Result<DeadLetter, DeadLetterError>;

    /// Claim up to `limit` due letters; each stays claimed for `lease`.
    async fn claim_due(&self, limit: usize, lease: Duration)
        -> Result<Vec<DeadLetter>, DeadLetterError>;

    /// Mark a claimed letter delivered. `false` if it was not claimed.
    async fn mark_delivered(&self, id: DbId) -> Result<bool, DeadLetterError>;

    /// Return a claimed letter to pending, due after `delay`.
    async fn reschedule(&self, id: DbId, error: &str, delay: Duration)
        -> Result<bool, DeadLetterError>;

    /// Every undelivered letter, oldest first.
    async fn list_pending(&self) -> Result<Vec<DeadLetter>, DeadLetterError>;

    /// Undelivered letters for one request.
    async fn list_for_request(&self, request_id: &str) -> Result<Vec<DeadLetter>, DeadLetterError>;
}
