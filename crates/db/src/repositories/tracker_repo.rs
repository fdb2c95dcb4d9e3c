//! Repository for `batch_trackers` and its output/failure child tables.
//!
//! Every mutation runs in one transaction that first takes the tracker
//! row lock (`SELECT ... FOR UPDATE`). Two workers finishing the last two
//! items of a group therefore serialize on the row, and each observes a
//! distinct post-increment count.

use pixelbatch_core::batch::{GroupKey, Progress};
use pixelbatch_core::job::OutputDescriptor;
use pixelbatch_core::types::DbId;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::tracker::{CounterRow, TrackerOutputRow, TrackerRow};

/// Column list for `batch_trackers` queries.
const COLUMNS: &str = "\
    request_id, group_id, expected_count, completed_count, failed_count, \
    created_at, updated_at";

/// Column list for `batch_tracker_outputs` queries.
const OUTPUT_COLUMNS: &str = "request_id, group_id, job_id, item_id, output_location, recorded_at";

/// Result of recording one job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordResult {
    /// The outcome was stored and the matching counter incremented.
    Counted(Progress),
    /// The job id was already recorded for this group; nothing changed.
    Duplicate(Progress),
    /// The group already has `expected_count` settled items.
    Full(Progress),
    /// No tracker row exists (never registered, or already drained).
    UnknownGroup,
}

/// Provides atomic counter operations for batch trackers.
pub struct TrackerRepo;

impl TrackerRepo {
    /// Create the tracker row if absent and return the stored row.
    ///
    /// An existing row is returned untouched, so callers can compare its
    /// `expected_count` with the one they tried to register.
    pub async fn insert_if_absent(
        pool: &PgPool,
        key: &GroupKey,
        expected: i32,
    ) -> Result<TrackerRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO batch_trackers (request_id, group_id, expected_count) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (request_id, group_id) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, TrackerRow>(&query)
            .bind(&key.request_id)
            .bind(&key.group_id)
            .bind(expected)
            .fetch_optional(pool)
            .await?;

        match inserted {
            Some(row) => Ok(row),
            None => Self::find(pool, key)
                .await?
                .ok_or(sqlx::Error::RowNotFound),
        }
    }

    /// Find a tracker row.
    pub async fn find(pool: &PgPool, key: &GroupKey) -> Result<Option<TrackerRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM batch_trackers WHERE request_id = $1 AND group_id = $2"
        );
        sqlx::query_as::<_, TrackerRow>(&query)
            .bind(&key.request_id)
            .bind(&key.group_id)
            .fetch_optional(pool)
            .await
    }

    /// Append an output and increment `completed_count` as one step.
    pub async fn record_completion(
        pool: &PgPool,
        key: &GroupKey,
        job_id: DbId,
        output: &OutputDescriptor,
    ) -> Result<RecordResult, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let Some(current) = Self::lock(&mut tx, key).await? else {
            return Ok(RecordResult::UnknownGroup);
        };

        let inserted = sqlx::query(
            "INSERT INTO batch_tracker_outputs \
                 (request_id, group_id, job_id, item_id, output_location) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (request_id, group_id, job_id) DO NOTHING",
        )
        .bind(&key.request_id)
        .bind(&key.group_id)
        .bind(job_id)
        .bind(&output.item_id)
        .bind(&output.output_location)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(RecordResult::Duplicate(current));
        }
        if current.is_full() {
            // Dropping the transaction rolls back the insert.
            return Ok(RecordResult::Full(current));
        }

        let updated = sqlx::query_as::<_, CounterRow>(
            "UPDATE batch_trackers SET completed_count = completed_count + 1 \
             WHERE request_id = $1 AND group_id = $2 \
             RETURNING expected_count, completed_count, failed_count",
        )
        .bind(&key.request_id)
        .bind(&key.group_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RecordResult::Counted(updated.into()))
    }

    /// Record a terminal job failure and increment `failed_count`.
    pub async fn record_failure(
        pool: &PgPool,
        key: &GroupKey,
        job_id: DbId,
        reason: &str,
    ) -> Result<RecordResult, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let Some(current) = Self::lock(&mut tx, key).await? else {
            return Ok(RecordResult::UnknownGroup);
        };

        let inserted = sqlx::query(
            "INSERT INTO batch_tracker_failures (request_id, group_id, job_id, reason) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (request_id, group_id, job_id) DO NOTHING",
        )
        .bind(&key.request_id)
        .bind(&key.group_id)
        .bind(job_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(RecordResult::Duplicate(current));
        }
        if current.is_full() {
            return Ok(RecordResult::Full(current));
        }

        let updated = sqlx::query_as::<_, CounterRow>(
            "UPDATE batch_trackers SET failed_count = failed_count + 1 \
             WHERE request_id = $1 AND group_id = $2 \
             RETURNING expected_count, completed_count, failed_count",
        )
        .bind(&key.request_id)
        .bind(&key.group_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RecordResult::Counted(updated.into()))
    }

    /// All outputs recorded for a group, oldest first.
    pub async fn outputs(
        pool: &PgPool,
        key: &GroupKey,
    ) -> Result<Vec<TrackerOutputRow>, sqlx::Error> {
        let query = format!(
            "SELECT {OUTPUT_COLUMNS} FROM batch_tracker_outputs \
             WHERE request_id = $1 AND group_id = $2 \
             ORDER BY recorded_at ASC, job_id ASC"
        );
        sqlx::query_as::<_, TrackerOutputRow>(&query)
            .bind(&key.request_id)
            .bind(&key.group_id)
            .fetch_all(pool)
            .await
    }

    /// Read every output of a group and delete its tracker row.
    ///
    /// Returns `None` if the row was already gone. Concurrent callers block
    /// on the row lock; only the first one sees the outputs.
    pub async fn drain(
        pool: &PgPool,
        key: &GroupKey,
    ) -> Result<Option<Vec<TrackerOutputRow>>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        if Self::lock(&mut tx, key).await?.is_none() {
            return Ok(None);
        }

        let query = format!(
            "SELECT {OUTPUT_COLUMNS} FROM batch_tracker_outputs \
             WHERE request_id = $1 AND group_id = $2 \
             ORDER BY recorded_at ASC, job_id ASC"
        );
        let outputs = sqlx::query_as::<_, TrackerOutputRow>(&query)
            .bind(&key.request_id)
            .bind(&key.group_id)
            .fetch_all(&mut *tx)
            .await?;

        // Child rows go with the parent via ON DELETE CASCADE.
        sqlx::query("DELETE FROM batch_trackers WHERE request_id = $1 AND group_id = $2")
            .bind(&key.request_id)
            .bind(&key.group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(outputs))
    }

    /// Every open tracker row for a request.
    pub async fn list_for_request(
        pool: &PgPool,
        request_id: &str,
    ) -> Result<Vec<TrackerRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM batch_trackers WHERE request_id = $1 ORDER BY group_id ASC"
        );
        sqlx::query_as::<_, TrackerRow>(&query)
            .bind(request_id)
            .fetch_all(pool)
            .await
    }

    /// Every recorded output for a request, grouped then oldest first.
    pub async fn outputs_for_request(
        pool: &PgPool,
        request_id: &str,
    ) -> Result<Vec<TrackerOutputRow>, sqlx::Error> {
        let query = format!(
            "SELECT {OUTPUT_COLUMNS} FROM batch_tracker_outputs \
             WHERE request_id = $1 \
             ORDER BY group_id ASC, recorded_at ASC, job_id ASC"
        );
        sqlx::query_as::<_, TrackerOutputRow>(&query)
            .bind(request_id)
            .fetch_all(pool)
            .await
    }

    /// Lock the tracker row for the rest of the transaction.
    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        key: &GroupKey,
    ) -> Result<Option<Progress>, sqlx::Error> {
        let row = sqlx::query_as::<_, CounterRow>(
            "SELECT expected_count, completed_count, failed_count FROM batch_trackers \
             WHERE request_id = $1 AND group_id = $2 \
             FOR UPDATE",
        )
        .bind(&key.request_id)
        .bind(&key.group_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(Progress::from))
    }
}
