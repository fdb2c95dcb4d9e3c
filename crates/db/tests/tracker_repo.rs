//! Integration tests for the batch tracker transactions.
//!
//! Require a live PostgreSQL reachable through `DATABASE_URL`; run with
//! `cargo test -p pixelbatch-db -- --ignored`.

use pixelbatch_core::batch::GroupKey;
use pixelbatch_core::job::OutputDescriptor;
use pixelbatch_db::repositories::{RecordResult, TrackerRepo};
use sqlx::PgPool;

fn output(key: &GroupKey, location: &str) -> OutputDescriptor {
    OutputDescriptor {
        request_id: key.request_id.clone(),
        group_id: key.group_id.clone(),
        item_id: None,
        output_location: location.to_string(),
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn insert_if_absent_keeps_first_expected(pool: PgPool) {
    let key = GroupKey::new("r", "g");
    let first = TrackerRepo::insert_if_absent(&pool, &key, 3).await.unwrap();
    let second = TrackerRepo::insert_if_absent(&pool, &key, 5).await.unwrap();
    assert_eq!(first.expected_count, 3);
    assert_eq!(second.expected_count, 3);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn completion_counts_once_per_job(pool: PgPool) {
    let key = GroupKey::new("r", "g");
    TrackerRepo::insert_if_absent(&pool, &key, 2).await.unwrap();

    let first = TrackerRepo::record_completion(&pool, &key, 10, &output(&key, "/o/1.jpg"))
        .await
        .unwrap();
    let again = TrackerRepo::record_completion(&pool, &key, 10, &output(&key, "/o/1.jpg"))
        .await
        .unwrap();

    let RecordResult::Counted(p) = first else {
        panic!("expected Counted, got {first:?}");
    };
    assert_eq!(p.completed, 1);
    assert!(matches!(again, RecordResult::Duplicate(p) if p.completed == 1));
    assert_eq!(TrackerRepo::outputs(&pool, &key).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_final_completions_observe_distinct_counts(pool: PgPool) {
    let key = GroupKey::new("r", "g");
    TrackerRepo::insert_if_absent(&pool, &key, 8).await.unwrap();

    let mut handles = Vec::new();
    for job_id in 0..8_i64 {
        let pool = pool.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let out = output(&key, &format!("/o/{job_id}.jpg"));
            TrackerRepo::record_completion(&pool, &key, job_id, &out)
                .await
                .unwrap()
        }));
    }

    let mut counts = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            RecordResult::Counted(p) => counts.push(p.completed),
            other => panic!("unexpected {other:?}"),
        }
    }
    counts.sort_unstable();
    assert_eq!(counts, (1..=8).collect::<Vec<_>>());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn drain_returns_outputs_once(pool: PgPool) {
    let key = GroupKey::new("r", "g");
    TrackerRepo::insert_if_absent(&pool, &key, 1).await.unwrap();
    TrackerRepo::record_completion(&pool, &key, 1, &output(&key, "/o/1.jpg"))
        .await
        .unwrap();

    let drained = TrackerRepo::drain(&pool, &key).await.unwrap().unwrap();
    assert_eq!(drained.len(), 1);
    assert!(TrackerRepo::drain(&pool, &key).await.unwrap().is_none());
    assert!(TrackerRepo::find(&pool, &key).await.unwrap().is_none());

    let late = TrackerRepo::record_completion(&pool, &key, 1, &output(&key, "/o/1.jpg"))
        .await
        .unwrap();
    assert_eq!(late, RecordResult::UnknownGroup);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn full_group_rejects_extra_outcomes(pool: PgPool) {
    let key = GroupKey::new("r", "g");
    TrackerRepo::insert_if_absent(&pool, &key, 1).await.unwrap();
    TrackerRepo::record_failure(&pool, &key, 1, "decode error").await.unwrap();

    let extra = TrackerRepo::record_completion(&pool, &key, 2, &output(&key, "/o/2.jpg"))
        .await
        .unwrap();
    assert!(matches!(extra, RecordResult::Full(p) if p.failed == 1 && p.completed == 0));
    assert!(TrackerRepo::outputs(&pool, &key).await.unwrap().is_empty());
}
