/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// Queue job identifier. Shares the key space of `image_jobs.id`.
pub type JobId = DbId;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
