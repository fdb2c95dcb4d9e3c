//! Repository for the `dead_letters` table.
//!
//! A dead letter holds the complete webhook body of a group whose tracker
//! entry was already cleared, so it is the only remaining copy of that
//! group's outputs.

use std::time::Duration;

use pixelbatch_core::batch::GroupKey;
use pixelbatch_core::types::DbId;
use sqlx::PgPool;

use crate::models::dead_letter::DeadLetterRow;
use crate::models::status::DeadLetterStatus;

/// Column list for `dead_letters` queries.
const COLUMNS: &str = "\
    id, request_id, group_id, payload, status_id, attempts, last_error, \
    next_attempt_at, created_at, delivered_at";

/// Provides persistence for undelivered webhook payloads.
pub struct DeadLetterRepo;

impl DeadLetterRepo {
    /// Store a payload for later redelivery, due after `delay`.
    ///
    /// A second insert for the same group overwrites the payload and resets
    /// the letter to `Pending`.
    pub async fn insert(
        pool: &PgPool,
        key: &GroupKey,
        payload: &serde_json::Value,
        error: &str,
        delay: Duration,
    ) -> Result<DeadLetterRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO dead_letters \
                 (request_id, group_id, payload, status_id, last_error, next_attempt_at) \
             VALUES ($1, $2, $3, $4, $5, NOW() + make_interval(secs => $6)) \
             ON CONFLICT (request_id, group_id) DO UPDATE \
             SET payload = EXCLUDED.payload, status_id = EXCLUDED.status_id, \
                 last_error = EXCLUDED.last_error, next_attempt_at = EXCLUDED.next_attempt_at \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(&key.request_id)
            .bind(&key.group_id)
            .bind(payload)
            .bind(DeadLetterStatus::Pending.id())
            .bind(error)
            .bind(delay.as_secs_f64())
            .fetch_one(pool)
            .await
    }

    /// Atomically claim up to `limit` due letters for delivery.
    ///
    /// A claimed letter moves to `Delivering` with `next_attempt_at` pushed
    /// out by `lease`; if the claimant dies the letter becomes due again
    /// once the lease passes. `FOR UPDATE SKIP LOCKED` keeps concurrent
    /// sweepers from claiming the same letter.
    pub async fn claim_due(
        pool: &PgPool,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
        let query = format!(
            "UPDATE dead_letters \
             SET status_id = $1, attempts = attempts + 1, \
                 next_attempt_at = NOW() + make_interval(secs => $2) \
             WHERE id IN ( \
                 SELECT id FROM dead_letters \
                 WHERE status_id IN ($3, $1) AND next_attempt_at <= NOW() \
                 ORDER BY next_attempt_at ASC \
                 LIMIT $4 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(DeadLetterStatus::Delivering.id())
            .bind(lease.as_secs_f64())
            .bind(DeadLetterStatus::Pending.id())
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Mark a claimed letter as delivered. Returns `false` if it was not
    /// in `Delivering`.
    pub async fn mark_delivered(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE dead_letters SET status_id = $2, delivered_at = NOW(), last_error = NULL \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(DeadLetterStatus::Delivered.id())
        .bind(DeadLetterStatus::Delivering.id())
        .execute(pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Return a claimed letter to `Pending`, due after `delay`.
    pub async fn reschedule(
        pool: &PgPool,
        id: DbId,
        error: &str,
        delay: Duration,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE dead_letters \
             SET status_id = $2, last_error = $3, \
                 next_attempt_at = NOW() + make_interval(secs => $4) \
             WHERE id = $1 AND status_id = $5",
        )
        .bind(id)
        .bind(DeadLetterStatus::Pending.id())
        .bind(error)
        .bind(delay.as_secs_f64())
        .bind(DeadLetterStatus::Delivering.id())
        .execute(pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Every letter not yet delivered, oldest first.
    pub async fn list_undelivered(pool: &PgPool) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM dead_letters WHERE status_id <> $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(DeadLetterStatus::Delivered.id())
            .fetch_all(pool)
            .await
    }

    /// Undelivered letters for one request (status boundary).
    pub async fn list_for_request(
        pool: &PgPool,
        request_id: &str,
    ) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM dead_letters \
             WHERE request_id = $1 AND status_id <> $2 \
             ORDER BY group_id ASC"
        );
        sqlx::query_as::<_, DeadLetterRow>(&query)
            .bind(request_id)
            .bind(DeadLetterStatus::Delivered.id())
            .fetch_all(pool)
            .await
    }
}
