//! PostgreSQL-backed dead-letter store over [`DeadLetterRepo`].

use std::time::Duration;

use async_trait::async_trait;
use pixelbatch_core::types::DbId;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_db::models::dead_letter::DeadLetterRow;
use pixelbatch_db::repositories::DeadLetterRepo;
use pixelbatch_db::DbPool;

use super::{DeadLetter, DeadLetterError, DeadLetterStore};

pub struct PgDeadLetters {
    pool: DbPool,
}

impl PgDeadLetters {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode_all(rows: Vec<DeadLetterRow>) -> Result<Vec<DeadLetter>, DeadLetterError> {
    rows.into_iter()
        .map(|row| DeadLetter::try_from(row).map_err(DeadLetterError::from))
        .collect()
}

#[async_trait]
impl DeadLetterStore for PgDeadLetters {
    async fn record(
        &self,
        payload: &WebhookPayload,
        error: &str,
        delay: Duration,
    ) -> Result<DeadLetter, DeadLetterError> {
        let body = serde_json::to_value(payload)?;
        let row =
            DeadLetterRepo::insert(&self.pool, &payload.group_key(), &body, error, delay).await?;
        Ok(DeadLetter::try_from(row)?)
    }

    async fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        decode_all(DeadLetterRepo::claim_due(&self.pool, limit, lease).await?)
    }

    async fn mark_delivered(&self, id: DbId) -> Result<bool, DeadLetterError> {
        Ok(DeadLetterRepo::mark_delivered(&self.pool, id).await?)
    }

    async fn reschedule(
        &self,
        id: DbId,
        error: &str,
        delay: Duration,
    ) -> Result<bool, DeadLetterError> {
        Ok(DeadLetterRepo::reschedule(&self.pool, id, error, delay).await?)
    }

    async fn list_pending(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        decode_all(DeadLetterRepo::list_undelivered(&self.pool).await?)
    }

    async fn list_for_request(&self, request_id: &str) -> Result<Vec<DeadLetter>, DeadLetterError> {
        decode_all(DeadLetterRepo::list_for_request(&self.pool, request_id).await?)
    }
}
