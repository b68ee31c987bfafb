//! Postgres-backed store.
//!
//! `commit_transition` runs the request update and the outbox insert in one
//! database transaction; schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::DispatchStore;
use crate::config::DatabaseConfig;
use crate::domain::{
    Capability, DispatchEvent, EmergencyRequest, EventType, GeoPoint, OutboxEntry, OutboxStatus,
    RequestStatus, AGGREGATE_EMERGENCY_REQUEST,
};
use crate::error::Result;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!("Connected to Postgres ({} max connections)", config.max_connections);
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn map_request(row: &PgRow) -> Result<EmergencyRequest> {
        Ok(EmergencyRequest {
            request_id: row.get("request_id"),
            requester_id: row.get("requester_id"),
            capability: Capability::parse(row.get::<&str, _>("capability"))?,
            origin: GeoPoint::new(row.get("origin_lat"), row.get("origin_lon")),
            description: row.get("description"),
            status: RequestStatus::parse(row.get::<&str, _>("status"))?,
            search_radius_km: row.get("search_radius_km"),
            assigned_provider_id: row.get("assigned_provider_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_entry(row: &PgRow) -> Result<OutboxEntry> {
        Ok(OutboxEntry {
            id: row.get("id"),
            aggregate_id: row.get("aggregate_id"),
            aggregate_type: row.get("aggregate_type"),
            event_type: EventType::parse(row.get::<&str, _>("event_type"))?,
            payload: row.get("payload"),
            status: OutboxStatus::parse(row.get::<&str, _>("status"))?,
            retry_count: row.get("retry_count"),
            next_attempt_at: row.get("next_attempt_at"),
            last_retry_at: row.get("last_retry_at"),
            published_at: row.get("published_at"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl DispatchStore for PostgresStore {
    async fn insert_request(&self, request: &EmergencyRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO emergency_requests (
                request_id, requester_id, capability, origin_lat, origin_lon,
                description, status, search_radius_km, assigned_provider_id,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(request.request_id)
        .bind(request.requester_id)
        .bind(request.capability.as_str())
        .bind(request.origin.lat)
        .bind(request.origin.lon)
        .bind(&request.description)
        .bind(request.status.as_str())
        .bind(request.search_radius_km)
        .bind(request.assigned_provider_id)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Inserted request {}", request.request_id);
        Ok(())
    }

    async fn commit_transition(
        &self,
        request: &EmergencyRequest,
        event: &DispatchEvent,
    ) -> Result<()> {
        let payload = event.to_payload()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE emergency_requests SET
                status = $2,
                search_radius_km = $3,
                assigned_provider_id = $4,
                updated_at = $5
            WHERE request_id = $1
            "#,
        )
        .bind(request.request_id)
        .bind(request.status.as_str())
        .bind(request.search_radius_km)
        .bind(request.assigned_provider_id)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO outbox_entries (
                aggregate_id, aggregate_type, event_type, payload,
                status, retry_count, next_attempt_at, created_at
            ) VALUES ($1, $2, $3, $4, 'pending', 0, NOW(), NOW())
            "#,
        )
        .bind(request.request_id)
        .bind(AGGREGATE_EMERGENCY_REQUEST)
        .bind(event.event_type().as_str())
        .bind(&payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            "Committed {} -> {} for request {}",
            event.event_type(),
            request.status,
            request.request_id
        );
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<EmergencyRequest>> {
        let row = sqlx::query(
            r#"
            SELECT request_id, requester_id, capability, origin_lat, origin_lon,
                   description, status, search_radius_km, assigned_provider_id,
                   created_at, updated_at
            FROM emergency_requests
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_request).transpose()
    }

    async fn fetch_due_outbox(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, aggregate_type, event_type, payload, status,
                   retry_count, next_attempt_at, last_retry_at, published_at, created_at
            FROM outbox_entries
            WHERE status = 'pending' AND next_attempt_at <= $1
            ORDER BY aggregate_id, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_entry).collect()
    }

    async fn mark_published(&self, entry_id: i64, published_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries SET
                status = 'published',
                published_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(entry_id)
        .bind(published_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_publish_failure(
        &self,
        entry_id: i64,
        next_attempt_at: DateTime<Utc>,
        exhausted: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries SET
                retry_count = retry_count + 1,
                last_retry_at = NOW(),
                next_attempt_at = $2,
                status = CASE WHEN $3 THEN 'failed' ELSE status END
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(next_attempt_at)
        .bind(exhausted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn rearm_failed(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries SET
                status = 'pending',
                retry_count = 0,
                next_attempt_at = $1
            WHERE status = 'failed'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn outbox_entries_for(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, aggregate_type, event_type, payload, status,
                   retry_count, next_attempt_at, last_retry_at, published_at, created_at
            FROM outbox_entries
            WHERE aggregate_id = $1
            ORDER BY id
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_entry).collect()
    }
}
