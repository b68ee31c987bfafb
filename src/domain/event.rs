//! Lifecycle events and the durable outbox record shape.
//!
//! `DispatchEvent` is the typed form used at the application boundary; the
//! persisted `OutboxEntry` carries it as an opaque JSON payload so the
//! storage engine stays agnostic. Deserialize only at the point of
//! interpretation (the downstream consumer).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Capability, CancelledBy, GeoPoint};
use crate::error::{LifelineError, Result};

/// Aggregate type tag for emergency requests
pub const AGGREGATE_EMERGENCY_REQUEST: &str = "emergency_request";

/// Event families, one bus topic each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
    NoProviders,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Accepted => "accepted",
            EventType::InProgress => "in_progress",
            EventType::Completed => "completed",
            EventType::Cancelled => "cancelled",
            EventType::NoProviders => "no_providers",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(EventType::Created),
            "accepted" => Ok(EventType::Accepted),
            "in_progress" => Ok(EventType::InProgress),
            "completed" => Ok(EventType::Completed),
            "cancelled" => Ok(EventType::Cancelled),
            "no_providers" => Ok(EventType::NoProviders),
            other => Err(LifelineError::UnexpectedState(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A state transition of one emergency request, in typed form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Created {
        request_id: Uuid,
        requester_id: Uuid,
        capability: Capability,
        origin: GeoPoint,
        description: String,
    },
    Accepted {
        request_id: Uuid,
        provider_id: Uuid,
        distance_km: f64,
        radius_km: f64,
    },
    InProgress {
        request_id: Uuid,
        provider_id: Uuid,
    },
    Completed {
        request_id: Uuid,
        provider_id: Uuid,
    },
    Cancelled {
        request_id: Uuid,
        cancelled_by: CancelledBy,
    },
    NoProviders {
        request_id: Uuid,
        final_radius_km: f64,
        rounds: u32,
    },
}

impl DispatchEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DispatchEvent::Created { .. } => EventType::Created,
            DispatchEvent::Accepted { .. } => EventType::Accepted,
            DispatchEvent::InProgress { .. } => EventType::InProgress,
            DispatchEvent::Completed { .. } => EventType::Completed,
            DispatchEvent::Cancelled { .. } => EventType::Cancelled,
            DispatchEvent::NoProviders { .. } => EventType::NoProviders,
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            DispatchEvent::Created { request_id, .. }
            | DispatchEvent::Accepted { request_id, .. }
            | DispatchEvent::InProgress { request_id, .. }
            | DispatchEvent::Completed { request_id, .. }
            | DispatchEvent::Cancelled { request_id, .. }
            | DispatchEvent::NoProviders { request_id, .. } => *request_id,
        }
    }

    /// Serialized payload as persisted in the outbox
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Outbox publication status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Recorded, awaiting publication
    Pending,
    /// Acknowledged by the bus
    Published,
    /// Retry budget exhausted; re-armable by a sweep
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(LifelineError::UnexpectedState(format!(
                "unknown outbox status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durably recorded event awaiting publication.
///
/// Created in the same transaction as the state change it describes;
/// transitions `pending -> published` exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    /// Earliest time the publisher may (re)attempt this entry
    pub next_attempt_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
