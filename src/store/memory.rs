//! In-memory store for tests and single-process dry runs.
//!
//! A single mutex serializes every operation, which is exactly what makes
//! `commit_transition` atomic here.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::DispatchStore;
use crate::domain::{
    DispatchEvent, EmergencyRequest, OutboxEntry, OutboxStatus, AGGREGATE_EMERGENCY_REQUEST,
};
use crate::error::{LifelineError, Result};

#[derive(Debug, Default)]
struct MemoryInner {
    requests: HashMap<Uuid, EmergencyRequest>,
    outbox: Vec<OutboxEntry>,
    next_entry_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn insert_request(&self, request: &EmergencyRequest) -> Result<()> {
        let mut inner = self.lock();
        if inner.requests.contains_key(&request.request_id) {
            return Err(LifelineError::Internal(format!(
                "request {} already exists",
                request.request_id
            )));
        }
        inner.requests.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn commit_transition(
        &self,
        request: &EmergencyRequest,
        event: &DispatchEvent,
    ) -> Result<()> {
        let payload = event.to_payload()?;
        let mut inner = self.lock();

        if !inner.requests.contains_key(&request.request_id) {
            return Err(LifelineError::RequestNotFound(request.request_id));
        }

        let now = Utc::now();
        inner.next_entry_id += 1;
        let entry = OutboxEntry {
            id: inner.next_entry_id,
            aggregate_id: request.request_id,
            aggregate_type: AGGREGATE_EMERGENCY_REQUEST.to_string(),
            event_type: event.event_type(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_attempt_at: now,
            last_retry_at: None,
            published_at: None,
            created_at: now,
        };

        inner.requests.insert(request.request_id, request.clone());
        inner.outbox.push(entry);
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<EmergencyRequest>> {
        Ok(self.lock().requests.get(&request_id).cloned())
    }

    async fn fetch_due_outbox(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEntry>> {
        let inner = self.lock();
        let mut due: Vec<OutboxEntry> = inner
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.aggregate_id, a.id).cmp(&(b.aggregate_id, b.id)));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_published(&self, entry_id: i64, published_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(entry) = inner
            .outbox
            .iter_mut()
            .find(|e| e.id == entry_id && e.status == OutboxStatus::Pending)
        {
            entry.status = OutboxStatus::Published;
            entry.published_at = Some(published_at);
        }
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        entry_id: i64,
        next_attempt_at: DateTime<Utc>,
        exhausted: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(entry) = inner.outbox.iter_mut().find(|e| e.id == entry_id) {
            entry.retry_count += 1;
            entry.last_retry_at = Some(Utc::now());
            entry.next_attempt_at = next_attempt_at;
            if exhausted {
                entry.status = OutboxStatus::Failed;
            }
        }
        Ok(())
    }

    async fn rearm_failed(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut rearmed = 0;
        for entry in inner.outbox.iter_mut() {
            if entry.status == OutboxStatus::Failed {
                entry.status = OutboxStatus::Pending;
                entry.retry_count = 0;
                entry.next_attempt_at = now;
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }

    async fn outbox_entries_for(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let inner = self.lock();
        let mut entries: Vec<OutboxEntry> = inner
            .outbox
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, GeoPoint, RequestStatus, RequestSubmission};

    fn request() -> EmergencyRequest {
        EmergencyRequest::from_submission(
            RequestSubmission {
                requester_id: Uuid::new_v4(),
                capability: Capability::Ambulance,
                origin: GeoPoint::new(27.7122, 85.3307),
                description: String::new(),
            },
            2.0,
        )
    }

    fn created_event(req: &EmergencyRequest) -> DispatchEvent {
        DispatchEvent::Created {
            request_id: req.request_id,
            requester_id: req.requester_id,
            capability: req.capability,
            origin: req.origin,
            description: req.description.clone(),
        }
    }

    #[tokio::test]
    async fn test_transition_commits_request_and_pending_entry_together() {
        let store = MemoryStore::new();
        let req = request();
        store.insert_request(&req).await.unwrap();

        let next = req.with_status(RequestStatus::Broadcasting).unwrap();
        store
            .commit_transition(&next, &created_event(&req))
            .await
            .unwrap();

        let stored = store.get_request(req.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Broadcasting);

        let entries = store.outbox_entries_for(req.request_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_commit_fails_for_unknown_request() {
        let store = MemoryStore::new();
        let req = request();
        let next = req.with_status(RequestStatus::Broadcasting).unwrap();

        let err = store
            .commit_transition(&next, &created_event(&req))
            .await
            .unwrap_err();
        assert!(matches!(err, LifelineError::RequestNotFound(_)));
        // Nothing leaked into the outbox
        assert!(store.outbox_entries_for(req.request_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_published_is_exactly_once() {
        let store = MemoryStore::new();
        let req = request();
        store.insert_request(&req).await.unwrap();
        let next = req.with_status(RequestStatus::Broadcasting).unwrap();
        store
            .commit_transition(&next, &created_event(&req))
            .await
            .unwrap();

        let first = Utc::now();
        store.mark_published(1, first).await.unwrap();
        // A second mark must not move the published timestamp
        store.mark_published(1, first + chrono::Duration::hours(1)).await.unwrap();

        let entries = store.outbox_entries_for(req.request_id).await.unwrap();
        assert_eq!(entries[0].status, OutboxStatus::Published);
        assert_eq!(entries[0].published_at, Some(first));
    }

    #[tokio::test]
    async fn test_fetch_due_respects_backoff_schedule() {
        let store = MemoryStore::new();
        let req = request();
        store.insert_request(&req).await.unwrap();
        let next = req.with_status(RequestStatus::Broadcasting).unwrap();
        store
            .commit_transition(&next, &created_event(&req))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(store.fetch_due_outbox(now, 10).await.unwrap().len(), 1);

        // Push the next attempt into the future
        store
            .record_publish_failure(1, now + chrono::Duration::seconds(30), false)
            .await
            .unwrap();
        assert!(store.fetch_due_outbox(now, 10).await.unwrap().is_empty());
        assert_eq!(
            store
                .fetch_due_outbox(now + chrono::Duration::seconds(31), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_rearm_failed_entries() {
        let store = MemoryStore::new();
        let req = request();
        store.insert_request(&req).await.unwrap();
        let next = req.with_status(RequestStatus::Broadcasting).unwrap();
        store
            .commit_transition(&next, &created_event(&req))
            .await
            .unwrap();

        let now = Utc::now();
        store.record_publish_failure(1, now, true).await.unwrap();
        let entries = store.outbox_entries_for(req.request_id).await.unwrap();
        assert_eq!(entries[0].status, OutboxStatus::Failed);

        assert_eq!(store.rearm_failed(now).await.unwrap(), 1);
        let entries = store.outbox_entries_for(req.request_id).await.unwrap();
        assert_eq!(entries[0].status, OutboxStatus::Pending);
        assert_eq!(entries[0].retry_count, 0);
    }
}
