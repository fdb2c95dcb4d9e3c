//! Repository for the `image_jobs` table.
//!
//! Every transition out of `Running` is guarded by the claim token issued
//! at claim time, so a worker whose lease expired cannot overwrite the
//! state written by the worker that re-claimed the job.

use std::time::Duration;

use pixelbatch_core::job::{ImageJob, LEASE_EXPIRED_REASON};
use pixelbatch_core::types::{DbId, Timestamp};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::job::{ImageJobRow, JobCounts};
use crate::models::status::{JobStatus, StatusId};

/// Column list for `image_jobs` queries.
const COLUMNS: &str = "\
    id, request_id, group_id, item_id, url, status_id, \
    attempts, max_attempts, claim_token, worker_name, \
    run_at, lease_expires_at, result, error_message, \
    submitted_at, claimed_at, completed_at, created_at, updated_at";

/// Provides queue operations for image jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new pending job, due immediately.
    pub async fn submit(
        pool: &PgPool,
        job: &ImageJob,
        max_attempts: i32,
    ) -> Result<ImageJobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO image_jobs (request_id, group_id, item_id, url, status_id, max_attempts) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ImageJobRow>(&query)
            .bind(&job.request_id)
            .bind(&job.group_id)
            .bind(&job.item_id)
            .bind(&job.url)
            .bind(JobStatus::Pending.id())
            .bind(max_attempts)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the oldest due pending job.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// claim the same row. The claim increments `attempts`, issues a fresh
    /// `claim_token` and sets `lease_expires_at = NOW() + lease`.
    pub async fn claim_next(
        pool: &PgPool,
        worker_name: &str,
        lease: Duration,
    ) -> Result<Option<ImageJobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE image_jobs \
             SET status_id = $1, attempts = attempts + 1, claim_token = $2, \
                 worker_name = $3, claimed_at = NOW(), \
                 lease_expires_at = NOW() + make_interval(secs => $4) \
             WHERE id = ( \
                 SELECT id FROM image_jobs \
                 WHERE status_id = $5 AND run_at <= NOW() \
                 ORDER BY run_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ImageJobRow>(&query)
            .bind(JobStatus::Running.id())
            .bind(Uuid::new_v4())
            .bind(worker_name)
            .bind(lease.as_secs_f64())
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Mark a claimed job as completed with its result payload.
    ///
    /// Returns `false` if the claim token no longer matches (lease lost).
    pub async fn complete(
        pool: &PgPool,
        job_id: DbId,
        claim_token: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE image_jobs \
             SET status_id = $3, result = $4, completed_at = NOW(), \
                 lease_expires_at = NULL, claim_token = NULL, error_message = NULL \
             WHERE id = $1 AND claim_token = $2 AND status_id = $5",
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(JobStatus::Completed.id())
        .bind(result)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Return a claimed job to `Pending`, due after `delay`.
    ///
    /// Returns the attempts made so far and the new `run_at`, or `None` if
    /// the lease was lost.
    pub async fn retry_later(
        pool: &PgPool,
        job_id: DbId,
        claim_token: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<Option<(i32, Timestamp)>, sqlx::Error> {
        sqlx::query_as::<_, (i32, Timestamp)>(
            "UPDATE image_jobs \
             SET status_id = $3, error_message = $4, \
                 run_at = NOW() + make_interval(secs => $5), \
                 lease_expires_at = NULL, claim_token = NULL \
             WHERE id = $1 AND claim_token = $2 AND status_id = $6 \
             RETURNING attempts, run_at",
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(JobStatus::Pending.id())
        .bind(error)
        .bind(delay.as_secs_f64())
        .bind(JobStatus::Running.id())
        .fetch_optional(pool)
        .await
    }

    /// Terminally fail a claimed job.
    ///
    /// Returns `false` if the lease was lost.
    pub async fn fail(
        pool: &PgPool,
        job_id: DbId,
        claim_token: Uuid,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE image_jobs \
             SET status_id = $3, error_message = $4, completed_at = NOW(), \
                 lease_expires_at = NULL, claim_token = NULL \
             WHERE id = $1 AND claim_token = $2 AND status_id = $5",
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(JobStatus::Failed.id())
        .bind(error)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Fail running jobs whose lease expired on their final attempt.
    ///
    /// Returns the failed rows so the caller can report them.
    pub async fn fail_expired(pool: &PgPool) -> Result<Vec<ImageJobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE image_jobs \
             SET status_id = $1, error_message = $2, completed_at = NOW(), \
                 lease_expires_at = NULL, claim_token = NULL \
             WHERE status_id = $3 AND lease_expires_at < NOW() AND attempts >= max_attempts \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ImageJobRow>(&query)
            .bind(JobStatus::Failed.id())
            .bind(LEASE_EXPIRED_REASON)
            .bind(JobStatus::Running.id())
            .fetch_all(pool)
            .await
    }

    /// Return running jobs with an expired lease to `Pending` for redelivery.
    pub async fn requeue_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE image_jobs \
             SET status_id = $1, run_at = NOW(), lease_expires_at = NULL, claim_token = NULL \
             WHERE status_id = $2 AND lease_expires_at < NOW() AND attempts < max_attempts",
        )
        .bind(JobStatus::Pending.id())
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<ImageJobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM image_jobs WHERE id = $1");
        sqlx::query_as::<_, ImageJobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Count a request's jobs per status.
    pub async fn counts_for_request(
        pool: &PgPool,
        request_id: &str,
    ) -> Result<JobCounts, sqlx::Error> {
        let rows = sqlx::query_as::<_, (StatusId, i64)>(
            "SELECT status_id, COUNT(*) FROM image_jobs \
             WHERE request_id = $1 \
             GROUP BY status_id",
        )
        .bind(request_id)
        .fetch_all(pool)
        .await?;

        let mut counts = JobCounts::default();
        for (status_id, n) in rows {
            match JobStatus::from_id(status_id) {
                Some(JobStatus::Pending) => counts.pending = n,
                Some(JobStatus::Running) => counts.running = n,
                Some(JobStatus::Completed) => counts.completed = n,
                Some(JobStatus::Failed) => counts.failed = n,
                None => tracing::warn!(status_id, "Unknown job status in counts"),
            }
        }
        Ok(counts)
    }
}
