//! In-process dead-letter store.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use pixelbatch_core::types::DbId;
use pixelbatch_core::webhook::WebhookPayload;
use pixelbatch_db::models::status::DeadLetterStatus;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{DeadLetter, DeadLetterError, DeadLetterStore};

struct Letter {
    letter: DeadLetter,
    status: DeadLetterStatus,
    next_attempt_at: Instant,
}

#[derive(Default)]
struct State {
    letters: BTreeMap<DbId, Letter>,
    next_id: DbId,
}

/// Dead letters held in process memory; lost on exit.
#[derive(Default)]
pub struct MemoryDeadLetters {
    state: Mutex<State>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Letters already delivered.
    pub async fn delivered(&self) -> Vec<DeadLetter> {
        let state = self.state.lock().await;
        state
            .letters
            .values()
            .filter(|l| l.status == DeadLetterStatus::Delivered)
            .map(|l| l.letter.clone())
            .collect()
    }

    async fn undelivered(&self, request_id: Option<&str>) -> Vec<DeadLetter> {
        let state = self.state.lock().await;
        state
            .letters
            .values()
            .filter(|l| l.status != DeadLetterStatus::Delivered)
            .filter(|l| request_id.map_or(true, |r| l.letter.payload.request_id == r))
            .map(|l| l.letter.clone())
            .collect()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetters {
    async fn record(
        &self,
        payload: &WebhookPayload,
        error: &str,
        delay: Duration,
    ) -> Result<DeadLetter, DeadLetterError> {
        let mut state = self.state.lock().await;
        let next_attempt_at = Instant::now() + delay;

        let key = payload.group_key();
        let existing = state
            .letters
            .iter_mut()
            .find(|(_, l)| l.letter.payload.group_key() == key);
        if let Some((_, letter)) = existing {
            letter.letter.payload = payload.clone();
            letter.letter.last_error = Some(error.to_string());
            letter.status = DeadLetterStatus::Pending;
            letter.next_attempt_at = next_attempt_at;
            return Ok(letter.letter.clone());
        }

        state.next_id += 1;
        let letter = DeadLetter {
            id: state.next_id,
            payload: payload.clone(),
            attempts: 0,
            last_error: Some(error.to_string()),
        };
        state.letters.insert(
            letter.id,
            Letter {
                letter: letter.clone(),
                status: DeadLetterStatus::Pending,
                next_attempt_at,
            },
        );
        Ok(letter)
    }

    async fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let mut due: Vec<_> = state
            .letters
            .iter_mut()
            .filter(|(_, l)| l.status != DeadLetterStatus::Delivered && l.next_attempt_at <= now)
            .map(|(_, l)| l)
            .collect();
        due.sort_by_key(|l| l.next_attempt_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|l| {
                l.status = DeadLetterStatus::Delivering;
                l.letter.attempts += 1;
                l.next_attempt_at = now + lease;
                l.letter.clone()
            })
            .collect())
    }

    async fn mark_delivered(&self, id: DbId) -> Result<bool, DeadLetterError> {
        let mut state = self.state.lock().await;
        match state.letters.get_mut(&id) {
            Some(l) if l.status == DeadLetterStatus::Delivering => {
                l.status = DeadLetterStatus::Delivered;
                l.letter.last_error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        id: DbId,
        error: &str,
        delay: Duration,
    ) -> Result<bool, DeadLetterError> {
        let mut state = self.state.lock().await;
        match state.letters.get_mut(&id) {
            Some(l) if l.status == DeadLetterStatus::Delivering => {
                l.status = DeadLetterStatus::Pending;
                l.letter.last_error = Some(error.to_string());
                l.next_attempt_at = Instant::now() + delay;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        Ok(self.undelivered(None).await)
    }

    async fn list_for_request(&self, request_id: &str) -> Result<Vec<DeadLetter>, DeadLetterError> {
        Ok(self.undelivered(Some(request_id)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(group: &str) -> WebhookPayload {
        WebhookPayload {
            request_id: "r1".into(),
            product_oid: group.into(),
            output_urls: vec![format!("/out/{group}.jpg")],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn letter_becomes_due_after_delay() {
        let store = MemoryDeadLetters::new();
        store
            .record(&payload("g1"), "HTTP 500", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(store.claim_due(10, Duration::from_secs(30)).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(10)).await;

        let claimed = store.claim_due(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].payload, payload("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_letter_is_not_reclaimed_within_lease() {
        let store = MemoryDeadLetters::new();
        store.record(&payload("g1"), "x", Duration::ZERO).await.unwrap();

        let first = store.claim_due(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(store.claim_due(10, Duration::from_secs(30)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = store.claim_due(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn delivered_letters_leave_pending_list() {
        let store = MemoryDeadLetters::new();
        let letter = store.record(&payload("g1"), "x", Duration::ZERO).await.unwrap();
        store.record(&payload("g2"), "x", Duration::from_secs(60)).await.unwrap();

        // Not claimed yet.
        assert!(!store.mark_delivered(letter.id).await.unwrap());

        store.claim_due(10, Duration::from_secs(30)).await.unwrap();
        assert!(store.mark_delivered(letter.id).await.unwrap());
        assert!(!store.mark_delivered(letter.id).await.unwrap());

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.product_oid, "g2");
        assert_eq!(store.delivered().await.len(), 1);
    }

    #[tokio::test]
    async fn second_record_for_group_replaces_payload() {
        let store = MemoryDeadLetters::new();
        let first = store.record(&payload("g1"), "a", Duration::ZERO).await.unwrap();
        let mut updated = payload("g1");
        updated.output_urls.push("/out/extra.jpg".into());
        let second = store.record(&updated, "b", Duration::ZERO).await.unwrap();

        assert_eq!(first.id, second.id);
        let pending = store.list_for_request("r1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.output_urls.len(), 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("b"));
    }
}
