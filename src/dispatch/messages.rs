//! Wire vocabulary for the realtime channel.
//!
//! A closed set of tagged variants replaces ad-hoc string event names; the
//! coordinator boundary matches exhaustively, so an unknown event is a
//! deserialization error, never a silent fallthrough.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{CancelledBy, Capability, GeoPoint};

/// A session on the realtime channel, one per connected party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room key scoping sessions to one emergency request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey(pub Uuid);

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything that travels over the realtime channel, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// Offer pushed to a candidate provider
    NewEmergency {
        request_id: Uuid,
        origin: GeoPoint,
        capability: Capability,
        description: String,
    },
    /// Provider decision: take the request
    AcceptRequest {
        request_id: Uuid,
        provider_id: Uuid,
    },
    /// Provider decision: pass on the request
    DeclineRequest {
        request_id: Uuid,
        provider_id: Uuid,
    },
    /// Requester (or assigned provider) abandons the request
    CancelRequest {
        request_id: Uuid,
        cancelled_by: CancelledBy,
    },
    /// Offer revoked: someone else won, or the round closed
    RequestTaken { request_id: Uuid },
    /// Answer to an accept that lost the race
    AlreadyTaken { request_id: Uuid },
    /// Progress update: radius escalated, a new round is starting
    SearchExpanded {
        request_id: Uuid,
        radius_km: f64,
    },
    /// The race is over; the requester learns its provider
    Assigned {
        request_id: Uuid,
        provider_id: Uuid,
        distance_km: f64,
    },
    /// Assigned provider is on site
    ProviderArrived {
        request_id: Uuid,
        provider_id: Uuid,
    },
    /// Assigned provider finished the job
    ServiceCompleted {
        request_id: Uuid,
        provider_id: Uuid,
    },
    /// Terminal notice to the requester: request was cancelled
    RequestCancelled { request_id: Uuid },
    /// Terminal notice to the requester: search exhausted
    NoProvidersAvailable { request_id: Uuid },
}

impl ChannelMessage {
    pub fn request_id(&self) -> Uuid {
        match self {
            ChannelMessage::NewEmergency { request_id, .. }
            | ChannelMessage::AcceptRequest { request_id, .. }
            | ChannelMessage::DeclineRequest { request_id, .. }
            | ChannelMessage::CancelRequest { request_id, .. }
            | ChannelMessage::RequestTaken { request_id }
            | ChannelMessage::AlreadyTaken { request_id }
            | ChannelMessage::SearchExpanded { request_id, .. }
            | ChannelMessage::Assigned { request_id, .. }
            | ChannelMessage::ProviderArrived { request_id, .. }
            | ChannelMessage::ServiceCompleted { request_id, .. }
            | ChannelMessage::RequestCancelled { request_id }
            | ChannelMessage::NoProvidersAvailable { request_id } => *request_id,
        }
    }
}

/// Inbound decisions routed to the coordinator that owns the request
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchCommand {
    Accept { provider_id: Uuid },
    Decline { provider_id: Uuid },
    Cancel { cancelled_by: CancelledBy },
    ProviderArrived { provider_id: Uuid },
    ServiceCompleted { provider_id: Uuid },
}
