//! Provider location ingest.
//!
//! Providers report their position and availability continuously; each
//! report replaces the previous index entry. A malformed report is logged
//! and dropped, it never stops the feed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Availability, Capability, GeoPoint};
use crate::error::Result;
use crate::geo::GeoIndex;

/// One report from the provider fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Position and availability update
    Location {
        provider_id: Uuid,
        capability: Capability,
        position: GeoPoint,
        availability: Availability,
    },
    /// Provider went offline; drop it from the index
    Deregister { provider_id: Uuid },
}

pub struct LocationFeed {
    geo: Arc<GeoIndex>,
}

impl LocationFeed {
    pub fn new(geo: Arc<GeoIndex>) -> Self {
        Self { geo }
    }

    pub fn apply(&self, message: FeedMessage) -> Result<()> {
        match message {
            FeedMessage::Location {
                provider_id,
                capability,
                position,
                availability,
            } => {
                self.geo
                    .upsert(provider_id, capability, position, availability)?;
                debug!(
                    "Provider {} at {} ({}, {})",
                    provider_id,
                    position,
                    capability,
                    availability
                );
            }
            FeedMessage::Deregister { provider_id } => {
                if self.geo.remove(provider_id) {
                    info!("Provider {} deregistered", provider_id);
                }
            }
        }
        Ok(())
    }

    /// Decode and apply one raw report; errors are reported, not fatal
    pub fn apply_raw(&self, raw: &[u8]) -> Result<()> {
        let message: FeedMessage = serde_json::from_slice(raw)?;
        self.apply(message)
    }

    /// Consume the feed until the sender side closes
    pub async fn run(self, mut reports: mpsc::Receiver<Vec<u8>>) {
        info!("Location feed started");
        while let Some(raw) = reports.recv().await {
            if let Err(e) = self.apply_raw(&raw) {
                warn!("Dropping malformed location report: {}", e);
            }
        }
        info!("Location feed stopped");
    }
}
