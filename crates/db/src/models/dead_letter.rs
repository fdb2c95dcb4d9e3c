//! Undelivered webhook payloads awaiting redelivery.

use pixelbatch_core::types::{DbId, Timestamp};
use pixelbatch_core::webhook::WebhookPayload;
use serde::Serialize;
use sqlx::FromRow;

use super::status::StatusId;

/// A row from the `dead_letters` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeadLetterRow {
    pub id: DbId,
    pub request_id: String,
    pub group_id: String,
    pub payload: serde_json::Value,
    pub status_id: StatusId,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: Timestamp,
    pub created_at: Timestamp,
    pub delivered_at: Option<Timestamp>,
}

impl DeadLetterRow {
    /// Decode the stored webhook body.
    pub fn webhook_payload(&self) -> Result<WebhookPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
