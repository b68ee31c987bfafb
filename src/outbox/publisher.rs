//! Outbox publisher daemon.
//!
//! Polls the outbox for due entries and pushes them to the bus with
//! at-least-once delivery. Entries are fetched in `(aggregate_id, id)`
//! order and, when one entry of an aggregate fails, the rest of that
//! aggregate is skipped for the cycle, which keeps per-request event order
//! intact on the wire. A slower sweep re-arms entries whose retry budget
//! ran out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bus::MessageBus;
use crate::alert::{Alert, AlertSink};
use crate::config::OutboxConfig;
use crate::domain::OutboxEntry;
use crate::error::Result;
use crate::store::DispatchStore;

/// Publisher statistics
#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    pub entries_published: u64,
    pub entries_failed: u64,
    pub entries_skipped: u64,
    pub entries_rearmed: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct OutboxPublisher {
    config: OutboxConfig,
    store: Arc<dyn DispatchStore>,
    bus: Arc<dyn MessageBus>,
    alerts: Arc<dyn AlertSink>,
    topic_prefix: String,
    stats: Arc<RwLock<PublisherStats>>,
    running: Arc<AtomicBool>,
}

impl OutboxPublisher {
    pub fn new(
        config: OutboxConfig,
        store: Arc<dyn DispatchStore>,
        bus: Arc<dyn MessageBus>,
        alerts: Arc<dyn AlertSink>,
        topic_prefix: String,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            alerts,
            topic_prefix,
            stats: Arc::new(RwLock::new(PublisherStats::default())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn topic_for(&self, entry: &OutboxEntry) -> String {
        format!("{}.{}", self.topic_prefix, entry.event_type)
    }

    /// Backoff with jitter so stalled batches do not retry in lockstep
    fn next_attempt_after(&self, retry_count: u32) -> DateTime<Utc> {
        let base = self.config.backoff_duration(retry_count);
        let jitter = base.as_secs_f64() * self.config.jitter_factor;
        let offset = if jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter)
        } else {
            0.0
        };
        Utc::now()
            + chrono::Duration::from_std(base + Duration::from_secs_f64(offset))
                .unwrap_or_else(|_| chrono::Duration::seconds(self.config.max_backoff_secs as i64))
    }

    /// Run a single publish cycle; returns (published, failed)
    pub async fn process_cycle(&self) -> Result<(u64, u64)> {
        let entries = self
            .store
            .fetch_due_outbox(Utc::now(), self.config.batch_size)
            .await?;
        if entries.is_empty() {
            return Ok((0, 0));
        }

        let mut published = 0u64;
        let mut failed = 0u64;
        let mut skipped = 0u64;
        // One failure holds back the whole aggregate for this cycle
        let mut stalled_aggregates: HashSet<Uuid> = HashSet::new();

        for entry in &entries {
            if stalled_aggregates.contains(&entry.aggregate_id) {
                skipped += 1;
                continue;
            }

            match self.publish_entry(entry).await {
                Ok(()) => published += 1,
                Err(e) => {
                    failed += 1;
                    stalled_aggregates.insert(entry.aggregate_id);
                    self.handle_failure(entry, &e).await;
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.entries_published += published;
        stats.entries_failed += failed;
        stats.entries_skipped += skipped;
        stats.last_run = Some(Utc::now());

        if failed > 0 {
            warn!(
                "Outbox cycle: {} published, {} failed, {} held back",
                published, failed, skipped
            );
        } else {
            debug!("Outbox cycle: {} published", published);
        }
        Ok((published, failed))
    }

    async fn publish_entry(&self, entry: &OutboxEntry) -> Result<()> {
        let topic = self.topic_for(entry);
        let key = entry.aggregate_id.to_string();
        let payload = serde_json::to_vec(&entry.payload)?;

        self.bus.publish(&topic, &key, &payload).await?;
        // Only after the broker ack; a crash between publish and this write
        // re-delivers the entry (at-least-once)
        self.store.mark_published(entry.id, Utc::now()).await?;
        debug!(
            "Published outbox entry {} ({}) for {}",
            entry.id, entry.event_type, entry.aggregate_id
        );
        Ok(())
    }

    async fn handle_failure(&self, entry: &OutboxEntry, cause: &crate::error::LifelineError) {
        let retry_count = entry.retry_count as u32;
        let exhausted = entry.retry_count + 1 >= self.config.max_attempts;
        let next_attempt_at = self.next_attempt_after(retry_count + 1);

        warn!(
            "Publish of outbox entry {} failed (attempt {}/{}): {}",
            entry.id,
            entry.retry_count + 1,
            self.config.max_attempts,
            cause
        );

        if let Err(e) = self
            .store
            .record_publish_failure(entry.id, next_attempt_at, exhausted)
            .await
        {
            error!("Could not record publish failure for {}: {}", entry.id, e);
            return;
        }

        self.stats.write().await.last_error = Some(cause.to_string());

        if exhausted {
            self.alerts
                .raise(Alert::critical(
                    "outbox_publisher",
                    format!(
                        "outbox entry {} ({} for {}) exhausted its retry budget: {}",
                        entry.id, entry.event_type, entry.aggregate_id, cause
                    ),
                ))
                .await;
        }
    }

    /// Flip `failed` entries back to `pending` so they get retried
    pub async fn rearm_cycle(&self) -> Result<u64> {
        let rearmed = self.store.rearm_failed(Utc::now()).await?;
        if rearmed > 0 {
            info!("Re-armed {} failed outbox entries", rearmed);
            self.stats.write().await.entries_rearmed += rearmed;
            self.alerts
                .raise(Alert::warning(
                    "outbox_publisher",
                    format!("{rearmed} exhausted outbox entries returned to rotation"),
                ))
                .await;
        }
        Ok(rearmed)
    }

    /// Start the publisher daemon; runs until `stop`
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Outbox publisher started (poll: {}s, batch: {}, max attempts: {})",
            self.config.poll_interval_secs, self.config.batch_size, self.config.max_attempts
        );

        let publisher = self.clone();
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(Duration::from_secs(
                publisher.config.poll_interval_secs,
            ));
            let mut rearm = tokio::time::interval(Duration::from_secs(
                publisher.config.rearm_interval_secs,
            ));
            // The first tick of each interval fires immediately
            rearm.tick().await;

            while publisher.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = poll.tick() => {
                        if let Err(e) = publisher.process_cycle().await {
                            error!("Outbox cycle failed: {}", e);
                            publisher.stats.write().await.last_error = Some(e.to_string());
                        }
                    }
                    _ = rearm.tick() => {
                        if let Err(e) = publisher.rearm_cycle().await {
                            error!("Outbox re-arm sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("Outbox publisher stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> PublisherStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingAlertSink;
    use crate::alert::AlertSeverity;
    use crate::domain::{
        CancelledBy, Capability, DispatchEvent, EmergencyRequest, GeoPoint, RequestStatus,
        RequestSubmission,
    };
    use crate::outbox::bus::testing::InMemoryBus;
    use crate::store::MemoryStore;

    fn test_request() -> EmergencyRequest {
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

    fn publisher_with(
        store: Arc<MemoryStore>,
        bus: Arc<InMemoryBus>,
        alerts: Arc<RecordingAlertSink>,
        max_attempts: i32,
    ) -> OutboxPublisher {
        let config = OutboxConfig {
            max_attempts,
            jitter_factor: 0.0,
            ..OutboxConfig::default()
        };
        OutboxPublisher::new(config, store, bus, alerts, "lifeline.events".to_string())
    }

    async fn seed_transitions(store: &MemoryStore) -> Uuid {
        let request = test_request();
        store.insert_request(&request).await.unwrap();

        let broadcasting = request.with_status(RequestStatus::Broadcasting).unwrap();
        let created = DispatchEvent::Created {
            request_id: request.request_id,
            requester_id: request.requester_id,
            capability: request.capability,
            origin: request.origin,
            description: request.description.clone(),
        };
        store.commit_transition(&broadcasting, &created).await.unwrap();

        let cancelled = broadcasting.with_status(RequestStatus::Cancelled).unwrap();
        let event = DispatchEvent::Cancelled {
            request_id: request.request_id,
            cancelled_by: CancelledBy::Requester,
        };
        store.commit_transition(&cancelled, &event).await.unwrap();

        request.request_id
    }

    #[tokio::test]
    async fn test_cycle_publishes_in_recording_order() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let request_id = seed_transitions(&store).await;
        let publisher = publisher_with(store.clone(), bus.clone(), alerts, 5);

        let (published, failed) = publisher.process_cycle().await.unwrap();
        assert_eq!(published, 2);
        assert_eq!(failed, 0);

        let messages = bus.published();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].topic, "lifeline.events.created");
        assert_eq!(messages[1].topic, "lifeline.events.cancelled");

        // Entries are now published and will not be re-fetched
        for entry in store.outbox_entries_for(request_id).await.unwrap() {
            assert_eq!(entry.status, crate::domain::OutboxStatus::Published);
            assert!(entry.published_at.is_some());
        }
        let (published_again, _) = publisher.process_cycle().await.unwrap();
        assert_eq!(published_again, 0);
    }

    #[tokio::test]
    async fn test_message_key_is_the_aggregate_id() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let request_id = seed_transitions(&store).await;
        let publisher = publisher_with(store.clone(), bus.clone(), alerts, 5);

        publisher.process_cycle().await.unwrap();

        // Consumers dedupe on (aggregate id, event type) and partitioned
        // buses route on the key, so every entry of a request must carry
        // the request id, not the outbox row number
        let messages = bus.published();
        assert_eq!(messages.len(), 2);
        for message in &messages {
            assert_eq!(message.key, request_id.to_string());
        }
    }

    #[tokio::test]
    async fn test_failed_aggregate_is_held_back_whole() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let request_id = seed_transitions(&store).await;
        let publisher = publisher_with(store.clone(), bus.clone(), alerts, 5);

        // First event of the aggregate cannot go out, so the second must not
        // overtake it
        bus.fail_topic("lifeline.events.created");
        let (published, failed) = publisher.process_cycle().await.unwrap();
        assert_eq!(published, 0);
        assert_eq!(failed, 1);
        assert!(bus.published().is_empty());

        let entries = store.outbox_entries_for(request_id).await.unwrap();
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(entries[1].retry_count, 0);

        // Once the topic heals and the backoff elapses, order is preserved
        bus.heal_topic("lifeline.events.created");
        let future = Utc::now() + chrono::Duration::hours(1);
        let due = store.fetch_due_outbox(future, 50).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].event_type.as_str(), "created");
    }

    #[tokio::test]
    async fn test_exhausted_entry_flips_failed_and_alerts() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let request_id = seed_transitions(&store).await;
        let publisher = publisher_with(store.clone(), bus.clone(), alerts.clone(), 1);

        bus.fail_topic("lifeline.events.created");
        publisher.process_cycle().await.unwrap();

        let entries = store.outbox_entries_for(request_id).await.unwrap();
        assert_eq!(entries[0].status, crate::domain::OutboxStatus::Failed);

        let raised = alerts.raised();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, AlertSeverity::Critical);

        // The re-arm sweep brings it back for another run and warns
        let rearmed = publisher.rearm_cycle().await.unwrap();
        assert_eq!(rearmed, 1);
        let entries = store.outbox_entries_for(request_id).await.unwrap();
        assert_eq!(entries[0].status, crate::domain::OutboxStatus::Pending);

        let raised = alerts.raised();
        assert_eq!(raised.len(), 2);
        assert_eq!(raised[1].severity, AlertSeverity::Warning);
    }
}
