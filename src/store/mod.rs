//! Durable state for requests and their outbox entries.
//!
//! The one rule every implementation must honor: a state transition and the
//! outbox entry describing it commit as a single atomic unit. If either
//! write fails, neither is visible, so the coordinator can retry the step
//! without externally observable side effects.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{DispatchEvent, EmergencyRequest, OutboxEntry};
use crate::error::Result;

#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Persist a newly submitted request (no outbox entry; creation itself
    /// is not a transition)
    async fn insert_request(&self, request: &EmergencyRequest) -> Result<()>;

    /// Atomically persist a transitioned request together with the pending
    /// outbox entry that describes the transition
    async fn commit_transition(
        &self,
        request: &EmergencyRequest,
        event: &DispatchEvent,
    ) -> Result<()>;

    async fn get_request(&self, request_id: Uuid) -> Result<Option<EmergencyRequest>>;

    /// Pending entries whose backoff delay has elapsed, ordered by
    /// `(aggregate_id, id)` so per-aggregate recording order is preserved
    async fn fetch_due_outbox(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEntry>>;

    /// Mark an entry published. Only a `pending` entry is affected, which
    /// makes the `pending -> published` transition happen exactly once.
    async fn mark_published(&self, entry_id: i64, published_at: DateTime<Utc>) -> Result<()>;

    /// Record a publish failure: bump the retry count, schedule the next
    /// attempt, and flip to `failed` when the budget is exhausted
    async fn record_publish_failure(
        &self,
        entry_id: i64,
        next_attempt_at: DateTime<Utc>,
        exhausted: bool,
    ) -> Result<()>;

    /// Re-arm `failed` entries back to `pending`; returns how many
    async fn rearm_failed(&self, now: DateTime<Utc>) -> Result<u64>;

    /// All outbox entries recorded for one aggregate, in recording order
    async fn outbox_entries_for(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEntry>>;
}

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
