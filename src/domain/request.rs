use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Capability, GeoPoint};
use crate::error::{LifelineError, Result};

/// Emergency request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Request submitted, not yet broadcast
    Pending,
    /// Offer rounds in flight
    Broadcasting,
    /// A provider won the acceptance race
    Accepted,
    /// Assigned provider is on site
    InProgress,
    /// Service rendered
    Completed,
    /// Cancelled by the requester or the assigned provider
    Cancelled,
    /// Escalation budget exhausted with no acceptance
    NoProvidersAvailable,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Broadcasting => "broadcasting",
            RequestStatus::Accepted => "accepted",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::NoProvidersAvailable => "no_providers_available",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "broadcasting" => Ok(RequestStatus::Broadcasting),
            "accepted" => Ok(RequestStatus::Accepted),
            "in_progress" => Ok(RequestStatus::InProgress),
            "completed" => Ok(RequestStatus::Completed),
            "cancelled" => Ok(RequestStatus::Cancelled),
            "no_providers_available" => Ok(RequestStatus::NoProvidersAvailable),
            other => Err(LifelineError::UnexpectedState(format!(
                "unknown request status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Cancelled
                | RequestStatus::NoProvidersAvailable
        )
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: RequestStatus) -> bool {
        use RequestStatus::*;

        match (self, target) {
            // From Pending
            (Pending, Broadcasting) => true,
            (Pending, Cancelled) => true, // Cancelled before first round

            // From Broadcasting
            (Broadcasting, Accepted) => true, // First accept wins
            (Broadcasting, Cancelled) => true, // Requester cancel
            (Broadcasting, NoProvidersAvailable) => true, // Budget exhausted

            // From Accepted
            (Accepted, InProgress) => true, // Provider arrived
            (Accepted, Cancelled) => true,

            // From InProgress
            (InProgress, Completed) => true, // Service rendered
            (InProgress, Cancelled) => true,

            // Terminal states have no exits
            _ => false,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who cancelled a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    Requester,
    Provider,
}

impl std::fmt::Display for CancelledBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelledBy::Requester => write!(f, "requester"),
            CancelledBy::Provider => write!(f, "provider"),
        }
    }
}

/// Parameters for submitting a new emergency request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSubmission {
    pub requester_id: Uuid,
    pub capability: Capability,
    pub origin: GeoPoint,
    #[serde(default)]
    pub description: String,
}

/// An emergency request (tracked in our system)
///
/// Identity, requester, capability and origin are fixed at creation;
/// everything else advances with the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyRequest {
    pub request_id: Uuid,
    pub requester_id: Uuid,
    pub capability: Capability,
    pub origin: GeoPoint,
    pub description: String,
    pub status: RequestStatus,
    /// Current search radius; grows monotonically across escalations
    pub search_radius_km: f64,
    /// Set exactly once, by the winning accept
    pub assigned_provider_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmergencyRequest {
    pub fn from_submission(submission: RequestSubmission, initial_radius_km: f64) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4(),
            requester_id: submission.requester_id,
            capability: submission.capability,
            origin: submission.origin,
            description: submission.description,
            status: RequestStatus::Pending,
            search_radius_km: initial_radius_km,
            assigned_provider_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce the request as it would look after a transition.
    ///
    /// Fails if the transition is not legal; the caller persists the
    /// returned value and only then replaces its in-memory copy.
    pub fn with_status(&self, status: RequestStatus) -> Result<Self> {
        if !self.status.can_transition_to(status) {
            return Err(LifelineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        Ok(next)
    }
}
