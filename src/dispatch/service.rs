//! Dispatch entry point and coordinator registry.
//!
//! The service owns the map of live coordinators: submissions spawn one,
//! inbound channel traffic is routed to one, and each coordinator removes
//! itself from the map when its request reaches a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::channel::RealtimeChannel;
use super::coordinator::{CoordinatorHandle, DispatchCoordinator};
use super::messages::{ChannelMessage, DispatchCommand, SessionId};
use crate::config::DispatchConfig;
use crate::domain::{EmergencyRequest, RequestSubmission};
use crate::error::{LifelineError, Result};
use crate::geo::GeoIndex;
use crate::store::DispatchStore;

pub struct DispatchService {
    geo: Arc<GeoIndex>,
    store: Arc<dyn DispatchStore>,
    channel: Arc<dyn RealtimeChannel>,
    config: DispatchConfig,
    active: Arc<RwLock<HashMap<Uuid, CoordinatorHandle>>>,
}

impl DispatchService {
    pub fn new(
        geo: Arc<GeoIndex>,
        store: Arc<dyn DispatchStore>,
        channel: Arc<dyn RealtimeChannel>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            geo,
            store,
            channel,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Accept a new emergency and start dispatching it.
    ///
    /// Returns the request id; the lifecycle runs on its own task.
    pub async fn submit(&self, submission: RequestSubmission) -> Result<Uuid> {
        let origin = submission.origin;
        if !(-90.0..=90.0).contains(&origin.lat) || !(-180.0..=180.0).contains(&origin.lon) {
            return Err(LifelineError::InvalidPosition(origin.to_string()));
        }

        let request = EmergencyRequest::from_submission(submission, self.config.initial_radius_km);
        let request_id = request.request_id;
        info!(
            "Submitting request {} ({} at {})",
            request_id, request.capability, request.origin
        );

        let (coordinator, handle) = DispatchCoordinator::new(
            request,
            self.geo.clone(),
            self.store.clone(),
            self.channel.clone(),
            self.config.clone(),
        );
        self.active.write().await.insert(request_id, handle);

        let active = self.active.clone();
        tokio::spawn(async move {
            coordinator.run().await;
            active.write().await.remove(&request_id);
        });

        Ok(request_id)
    }

    /// Route a decision to the request's coordinator.
    ///
    /// A request with no live coordinator is either finished
    /// (`RequestClosed`) or was never seen (`RequestNotFound`).
    pub async fn dispatch_command(&self, request_id: Uuid, command: DispatchCommand) -> Result<()> {
        let handle = self.active.read().await.get(&request_id).cloned();
        match handle {
            Some(handle) => handle.command(command).await,
            None => match self.store.get_request(request_id).await? {
                Some(_) => Err(LifelineError::RequestClosed(request_id)),
                None => Err(LifelineError::RequestNotFound(request_id)),
            },
        }
    }

    /// Interpret an inbound channel message from a connected session.
    ///
    /// Only client-originated variants are accepted; server-to-client
    /// notifications arriving inbound are a protocol violation.
    pub async fn handle_message(&self, session: SessionId, message: ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::AcceptRequest {
                request_id,
                provider_id,
            } => {
                self.dispatch_command(request_id, DispatchCommand::Accept { provider_id })
                    .await
            }
            ChannelMessage::DeclineRequest {
                request_id,
                provider_id,
            } => {
                self.dispatch_command(request_id, DispatchCommand::Decline { provider_id })
                    .await
            }
            ChannelMessage::CancelRequest {
                request_id,
                cancelled_by,
            } => {
                self.dispatch_command(request_id, DispatchCommand::Cancel { cancelled_by })
                    .await
            }
            ChannelMessage::ProviderArrived {
                request_id,
                provider_id,
            } => {
                self.dispatch_command(request_id, DispatchCommand::ProviderArrived { provider_id })
                    .await
            }
            ChannelMessage::ServiceCompleted {
                request_id,
                provider_id,
            } => {
                self.dispatch_command(request_id, DispatchCommand::ServiceCompleted { provider_id })
                    .await
            }
            other => {
                warn!("Session {} sent a server-only message: {:?}", session, other);
                Err(LifelineError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Number of requests currently being dispatched
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }
}
