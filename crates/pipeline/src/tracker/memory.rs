//! In-process batch tracker.
//!
//! One `tokio::sync::Mutex` guards every entry, so each record call is a
//! single critical section: dedup check, output append and counter
//! increment happen together and two concurrent finishers of the same
//! group observe distinct counts.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use pixelbatch_core::batch::{validate_expected_count, GroupKey, GroupStatus, Progress, RecordOutcome};
use pixelbatch_core::job::OutputDescriptor;
use pixelbatch_core::types::JobId;
use tokio::sync::Mutex;

use super::{BatchTracker, TrackerError};

struct Entry {
    progress: Progress,
    /// Insertion-ordered; at most one output per job id.
    outputs: Vec<(JobId, OutputDescriptor)>,
    failures: HashMap<JobId, String>,
}

impl Entry {
    fn has_output(&self, job_id: JobId) -> bool {
        self.outputs.iter().any(|(id, _)| *id == job_id)
    }

    fn output_list(&self) -> Vec<OutputDescriptor> {
        self.outputs.iter().map(|(_, o)| o.clone()).collect()
    }
}

/// Tracker held in process memory.
#[derive(Default)]
pub struct MemoryTracker {
    entries: Mutex<BTreeMap<GroupKey, Entry>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl BatchTracker for MemoryTracker {
    async fn register_group(&self, key: &GroupKey, expected: i32) -> Result<(), TrackerError> {
        validate_expected_count(expected)?;
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            if existing.progress.expected != expected {
                return Err(TrackerError::ExpectedMismatch {
                    key: key.clone(),
                    registered: existing.progress.expected,
                    requested: expected,
                });
            }
            return Ok(());
        }
        entries.insert(
            key.clone(),
            Entry {
                progress: Progress::new(expected),
                outputs: Vec::new(),
                failures: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn record_completion(
        &self,
        key: &GroupKey,
        job_id: JobId,
        output: &OutputDescriptor,
    ) -> Result<RecordOutcome, TrackerError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| TrackerError::UnknownGroup(key.clone()))?;

        if entry.has_output(job_id) {
            return Ok(RecordOutcome {
                progress: entry.progress,
                newly_counted: false,
            });
        }
        if entry.progress.is_full() {
            return Err(TrackerError::Overflow {
                key: key.clone(),
                progress: entry.progress,
            });
        }

        entry.outputs.push((job_id, output.clone()));
        entry.progress.completed += 1;
        Ok(RecordOutcome {
            progress: entry.progress,
            newly_counted: true,
        })
    }

    async fn record_failure(
        &self,
        key: &GroupKey,
        job_id: JobId,
        reason: &str,
    ) -> Result<RecordOutcome, TrackerError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| TrackerError::UnknownGroup(key.clone()))?;

        if entry.failures.contains_key(&job_id) {
            return Ok(RecordOutcome {
                progress: entry.progress,
                newly_counted: false,
            });
        }
        if entry.progress.is_full() {
            return Err(TrackerError::Overflow {
                key: key.clone(),
                progress: entry.progress,
            });
        }

        entry.failures.insert(job_id, reason.to_string());
        entry.progress.failed += 1;
        Ok(RecordOutcome {
            progress: entry.progress,
            newly_counted: true,
        })
    }

    async fn progress(&self, key: &GroupKey) -> Result<Progress, TrackerError> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|e| e.progress)
            .ok_or_else(|| TrackerError::UnknownGroup(key.clone()))
    }

    async fn outputs(&self, key: &GroupKey) -> Result<Vec<OutputDescriptor>, TrackerError> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(Entry::output_list)
            .ok_or_else(|| TrackerError::UnknownGroup(key.clone()))
    }

    async fn drain_and_clear(
        &self,
        key: &GroupKey,
    ) -> Result<Option<Vec<OutputDescriptor>>, TrackerError> {
        let removed = self.entries.lock().await.remove(key);
        Ok(removed.map(|e| e.outputs.into_iter().map(|(_, o)| o).collect()))
    }

    async fn request_status(&self, request_id: &str) -> Result<Vec<GroupStatus>, TrackerError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(key, _)| key.request_id == request_id)
            .map(|(key, entry)| GroupStatus {
                group_id: key.group_id.clone(),
                progress: entry.progress,
                outputs: entry.output_list(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use pixelbatch_core::batch::FailurePolicy;

    use super::*;

    fn key() -> GroupKey {
        GroupKey::new("r1", "g1")
    }

    fn output(item: &str) -> OutputDescriptor {
        OutputDescriptor {
            request_id: "r1".into(),
            group_id: "g1".into(),
            item_id: Some(item.into()),
            output_location: format!("/out/{item}.jpg"),
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_for_same_count() {
        let tracker = MemoryTracker::new();
        tracker.register_group(&key(), 3).await.unwrap();
        tracker.register_group(&key(), 3).await.unwrap();

        let err = tracker.register_group(&key(), 4).await.unwrap_err();
        assert_matches!(
            err,
            TrackerError::ExpectedMismatch { registered: 3, requested: 4, .. }
        );
    }

    #[tokio::test]
    async fn register_rejects_zero() {
        let tracker = MemoryTracker::new();
        let err = tracker.register_group(&key(), 0).await.unwrap_err();
        assert_matches!(err, TrackerError::Validation(_));
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn completion_before_registration_is_unknown() {
        let tracker = MemoryTracker::new();
        let err = tracker
            .record_completion(&key(), 1, &output("a"))
            .await
            .unwrap_err();
        assert_matches!(err, TrackerError::UnknownGroup(_));
    }

    #[tokio::test]
    async fn outputs_track_completed_count() {
        let tracker = MemoryTracker::new();
        tracker.register_group(&key(), 3).await.unwrap();

        for (job_id, item) in [(3, "c"), (1, "a")] {
            let outcome = tracker
                .record_completion(&key(), job_id, &output(item))
                .await
                .unwrap();
            let outputs = tracker.outputs(&key()).await.unwrap();
            assert_eq!(outputs.len() as i32, outcome.progress.completed);
        }
        assert_eq!(tracker.progress(&key()).await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn duplicate_job_is_not_counted_twice() {
        let tracker = MemoryTracker::new();
        tracker.register_group(&key(), 2).await.unwrap();

        let first = tracker.record_completion(&key(), 7, &output("a")).await.unwrap();
        let again = tracker.record_completion(&key(), 7, &output("a")).await.unwrap();

        assert!(first.newly_counted);
        assert!(!again.newly_counted);
        assert_eq!(again.progress.completed, 1);
        assert_eq!(tracker.outputs(&key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_group_rejects_new_jobs() {
        let tracker = MemoryTracker::new();
        tracker.register_group(&key(), 1).await.unwrap();
        tracker.record_completion(&key(), 1, &output("a")).await.unwrap();

        let err = tracker
            .record_completion(&key(), 2, &output("b"))
            .await
            .unwrap_err();
        assert_matches!(err, TrackerError::Overflow { .. });
        assert_eq!(tracker.progress(&key()).await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn failures_count_separately() {
        let tracker = MemoryTracker::new();
        tracker.register_group(&key(), 2).await.unwrap();
        tracker.record_completion(&key(), 1, &output("a")).await.unwrap();
        let outcome = tracker.record_failure(&key(), 2, "404").await.unwrap();

        assert_eq!(outcome.progress.completed, 1);
        assert_eq!(outcome.progress.failed, 1);
        assert!(!outcome.closes_group(FailurePolicy::Strict));
        assert!(outcome.closes_group(FailurePolicy::CountFailures));
    }

    #[tokio::test]
    async fn drain_returns_outputs_once() {
        let tracker = MemoryTracker::new();
        tracker.register_group(&key(), 1).await.unwrap();
        tracker.record_completion(&key(), 1, &output("a")).await.unwrap();

        let drained = tracker.drain_and_clear(&key()).await.unwrap();
        assert_eq!(drained, Some(vec![output("a")]));
        assert_eq!(tracker.drain_and_clear(&key()).await.unwrap(), None);

        let late = tracker
            .record_completion(&key(), 1, &output("a"))
            .await
            .unwrap_err();
        assert_matches!(late, TrackerError::UnknownGroup(_));
    }

    #[tokio::test]
    async fn concurrent_completions_observe_distinct_counts() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.register_group(&key(), 8).await.unwrap();

        let mut handles = Vec::new();
        for job_id in 1..=8 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                let out = output(&format!("i{job_id}"));
                tracker.record_completion(&key(), job_id, &out).await.unwrap()
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().progress.completed);
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn request_status_lists_open_groups() {
        let tracker = MemoryTracker::new();
        tracker.register_group(&GroupKey::new("r1", "g2"), 2).await.unwrap();
        tracker.register_group(&key(), 1).await.unwrap();
        tracker.register_group(&GroupKey::new("r2", "g1"), 1).await.unwrap();
        tracker.record_completion(&key(), 1, &output("a")).await.unwrap();

        let status = tracker.request_status("r1").await.unwrap();
        let groups: Vec<_> = status.iter().map(|s| s.group_id.as_str()).collect();
        assert_eq!(groups, ["g1", "g2"]);
        assert_eq!(status[0].outputs, vec![output("a")]);
        assert_eq!(status[1].progress, Progress::new(2));
    }
}
