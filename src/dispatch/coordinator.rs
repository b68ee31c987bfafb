//! Per-request dispatch state machine.
//!
//! One coordinator task owns one `EmergencyRequest` for its whole lifecycle.
//! All decisions for the request arrive serialized on a command channel, and
//! the winning accept additionally claims a set-once slot, so the
//! at-most-one-winner invariant holds by construction rather than by query
//! timing. State is only advanced in memory after the transition and its
//! outbox entry have committed durably as one unit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::RealtimeChannel;
use super::messages::{ChannelMessage, DispatchCommand, RoomKey, SessionId};
use crate::config::DispatchConfig;
use crate::domain::{
    Availability, CancelledBy, DispatchEvent, EmergencyRequest, RequestStatus,
};
use crate::error::{LifelineError, Result};
use crate::geo::{GeoIndex, Ranker};
use crate::store::DispatchStore;

const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(200);
const COMMAND_BUFFER: usize = 32;

/// Handle for routing decisions to a live coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    request_id: Uuid,
    commands: mpsc::Sender<DispatchCommand>,
}

impl CoordinatorHandle {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub async fn command(&self, command: DispatchCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LifelineError::RequestClosed(self.request_id))
    }
}

pub struct DispatchCoordinator {
    request: EmergencyRequest,
    geo: Arc<GeoIndex>,
    ranker: Ranker,
    store: Arc<dyn DispatchStore>,
    channel: Arc<dyn RealtimeChannel>,
    config: DispatchConfig,
    commands: mpsc::Receiver<DispatchCommand>,
    /// Claimed exactly once by the winning accept
    winner: OnceLock<Uuid>,
    /// Providers offered at any point in this lifecycle; never re-offered
    offered_ever: HashSet<Uuid>,
    /// Sessions this coordinator joined to the request room
    joined: HashSet<SessionId>,
    rounds_started: u32,
}

impl DispatchCoordinator {
    pub fn new(
        request: EmergencyRequest,
        geo: Arc<GeoIndex>,
        store: Arc<dyn DispatchStore>,
        channel: Arc<dyn RealtimeChannel>,
        config: DispatchConfig,
    ) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = CoordinatorHandle {
            request_id: request.request_id,
            commands: tx,
        };
        let ranker = Ranker::new(geo.clone());
        let coordinator = Self {
            request,
            geo,
            ranker,
            store,
            channel,
            config,
            commands: rx,
            winner: OnceLock::new(),
            offered_ever: HashSet::new(),
            joined: HashSet::new(),
            rounds_started: 0,
        };
        (coordinator, handle)
    }

    fn room(&self) -> RoomKey {
        RoomKey(self.request.request_id)
    }

    fn requester_session(&self) -> SessionId {
        SessionId(self.request.requester_id)
    }

    /// Drive the request to a terminal state
    pub async fn run(mut self) {
        let request_id = self.request.request_id;
        if let Err(e) = self.run_inner().await {
            error!("Dispatch for request {} aborted: {}", request_id, e);
        }
        self.cleanup_room().await;
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.store.insert_request(&self.request).await?;

        let created = DispatchEvent::Created {
            request_id: self.request.request_id,
            requester_id: self.request.requester_id,
            capability: self.request.capability,
            origin: self.request.origin,
            description: self.request.description.clone(),
        };
        let next = self.request.with_status(RequestStatus::Broadcasting)?;
        self.commit(next, created).await?;
        info!(
            "Request {} broadcasting ({} within {:.1}km)",
            self.request.request_id, self.request.capability, self.request.search_radius_km
        );

        self.join_session(self.requester_session()).await;

        match self.broadcast_phase().await? {
            Some(winner) => self.assigned_phase(winner).await,
            None => Ok(()),
        }
    }

    // ==================== Broadcast phase ====================

    /// Run offer rounds until a provider wins, the requester cancels, or the
    /// escalation budget runs out. Returns the winner, or `None` when a
    /// terminal state was reached.
    async fn broadcast_phase(&mut self) -> Result<Option<Uuid>> {
        let mut escalations = 0u32;

        loop {
            let ring = self.geo.ring_for_radius(self.request.search_radius_km);
            let mut candidate_ids = self.geo.candidates(
                self.request.origin,
                self.request.capability,
                ring,
            )?;
            candidate_ids.retain(|id| !self.offered_ever.contains(id));
            let ranked = self
                .ranker
                .rank(self.request.origin, &candidate_ids, self.config.top_k);

            if ranked.is_empty() {
                debug!(
                    "Request {}: no candidates within {:.1}km",
                    self.request.request_id, self.request.search_radius_km
                );
                if escalations >= self.config.max_escalations {
                    self.finish_no_providers().await?;
                    return Ok(None);
                }
                escalations += 1;
                self.escalate().await;
                continue;
            }

            // Fan out offers; a delivery failure is an implicit decline
            self.rounds_started += 1;
            let mut undecided: HashMap<Uuid, f64> = HashMap::new();
            for candidate in &ranked {
                self.offered_ever.insert(candidate.provider_id);
                let session = SessionId(candidate.provider_id);
                let offer = ChannelMessage::NewEmergency {
                    request_id: self.request.request_id,
                    origin: self.request.origin,
                    capability: self.request.capability,
                    description: self.request.description.clone(),
                };
                match self.channel.send(session, offer).await {
                    Ok(()) => {
                        undecided.insert(candidate.provider_id, candidate.distance_km);
                        self.join_session(session).await;
                    }
                    Err(e) => warn!(
                        "Offer to provider {} undeliverable, treating as decline: {}",
                        candidate.provider_id, e
                    ),
                }
            }
            debug!(
                "Request {}: round {} offered to {} of {} candidates",
                self.request.request_id,
                self.rounds_started,
                undecided.len(),
                ranked.len()
            );

            if !undecided.is_empty() {
                let deadline = Instant::now() + self.config.offer_timeout();
                if let Some(winner) = self.decision_window(deadline, &mut undecided).await? {
                    return Ok(winner.into_winner());
                }
                // Round closed without a winner: withdraw remaining offers
                for provider_id in undecided.keys() {
                    self.notify(
                        SessionId(*provider_id),
                        ChannelMessage::RequestTaken {
                            request_id: self.request.request_id,
                        },
                    )
                    .await;
                }
            }

            if escalations >= self.config.max_escalations {
                self.finish_no_providers().await?;
                return Ok(None);
            }
            escalations += 1;
            self.escalate().await;
        }
    }

    /// Wait for decisions until the round deadline. `Some(outcome)` ends the
    /// broadcast phase; `None` means the round closed without a winner.
    async fn decision_window(
        &mut self,
        deadline: Instant,
        undecided: &mut HashMap<Uuid, f64>,
    ) -> Result<Option<PhaseEnd>> {
        loop {
            match timeout_at(deadline, self.commands.recv()).await {
                Ok(Some(DispatchCommand::Accept { provider_id })) => {
                    let Some(&distance_km) = undecided.get(&provider_id) else {
                        // Late or never-offered accept: race-loss semantics
                        self.notify(
                            SessionId(provider_id),
                            ChannelMessage::AlreadyTaken {
                                request_id: self.request.request_id,
                            },
                        )
                        .await;
                        continue;
                    };

                    if self.winner.set(provider_id).is_err() {
                        self.notify(
                            SessionId(provider_id),
                            ChannelMessage::AlreadyTaken {
                                request_id: self.request.request_id,
                            },
                        )
                        .await;
                        continue;
                    }

                    undecided.remove(&provider_id);
                    self.commit_accept(provider_id, distance_km).await?;
                    self.announce_winner(provider_id, distance_km, undecided).await;
                    return Ok(Some(PhaseEnd::Won(provider_id)));
                }
                Ok(Some(DispatchCommand::Decline { provider_id })) => {
                    if undecided.remove(&provider_id).is_some() {
                        debug!(
                            "Provider {} declined request {}",
                            provider_id, self.request.request_id
                        );
                    }
                    if undecided.is_empty() {
                        // Everyone answered; no point waiting out the window
                        return Ok(None);
                    }
                }
                Ok(Some(DispatchCommand::Cancel { cancelled_by })) => {
                    self.finish_cancelled(cancelled_by, undecided).await?;
                    return Ok(Some(PhaseEnd::Terminal));
                }
                Ok(Some(other)) => {
                    warn!(
                        "Request {}: ignoring {:?} before acceptance",
                        self.request.request_id, other
                    );
                }
                Ok(None) => {
                    warn!(
                        "Request {}: command channel closed mid-broadcast, cancelling",
                        self.request.request_id
                    );
                    self.finish_cancelled(CancelledBy::Requester, undecided).await?;
                    return Ok(Some(PhaseEnd::Terminal));
                }
                Err(_elapsed) => return Ok(None),
            }
        }
    }

    // ==================== Assigned phase ====================

    async fn assigned_phase(&mut self, winner: Uuid) -> Result<()> {
        loop {
            match self.commands.recv().await {
                Some(DispatchCommand::Accept { provider_id }) => {
                    // Race loss after the fact
                    self.notify(
                        SessionId(provider_id),
                        ChannelMessage::AlreadyTaken {
                            request_id: self.request.request_id,
                        },
                    )
                    .await;
                }
                Some(DispatchCommand::Decline { provider_id }) => {
                    debug!(
                        "Stale decline from {} for request {}",
                        provider_id, self.request.request_id
                    );
                }
                Some(DispatchCommand::Cancel { cancelled_by }) => {
                    self.finish_cancelled(cancelled_by, &HashMap::new()).await?;
                    return Ok(());
                }
                Some(DispatchCommand::ProviderArrived { provider_id }) => {
                    if provider_id != winner
                        || self.request.status != RequestStatus::Accepted
                    {
                        warn!(
                            "Unexpected arrival signal from {} for request {} in {}",
                            provider_id, self.request.request_id, self.request.status
                        );
                        continue;
                    }
                    let next = self.request.with_status(RequestStatus::InProgress)?;
                    let event = DispatchEvent::InProgress {
                        request_id: self.request.request_id,
                        provider_id,
                    };
                    self.commit(next, event).await?;
                    self.notify(
                        self.requester_session(),
                        ChannelMessage::ProviderArrived {
                            request_id: self.request.request_id,
                            provider_id,
                        },
                    )
                    .await;
                }
                Some(DispatchCommand::ServiceCompleted { provider_id }) => {
                    if provider_id != winner
                        || self.request.status != RequestStatus::InProgress
                    {
                        warn!(
                            "Unexpected completion signal from {} for request {} in {}",
                            provider_id, self.request.request_id, self.request.status
                        );
                        continue;
                    }
                    let next = self.request.with_status(RequestStatus::Completed)?;
                    let event = DispatchEvent::Completed {
                        request_id: self.request.request_id,
                        provider_id,
                    };
                    self.commit(next, event).await?;
                    self.notify(
                        self.requester_session(),
                        ChannelMessage::ServiceCompleted {
                            request_id: self.request.request_id,
                            provider_id,
                        },
                    )
                    .await;
                    info!("Request {} completed by {}", self.request.request_id, winner);
                    // The provider stays assigned until its own availability
                    // update arrives on the location feed
                    return Ok(());
                }
                None => {
                    warn!(
                        "Request {}: command channel closed in {}",
                        self.request.request_id, self.request.status
                    );
                    return Ok(());
                }
            }
        }
    }

    // ==================== Transitions ====================

    /// Persist a transition and only then advance the in-memory request.
    ///
    /// The store write is atomic with the outbox insert; on failure nothing
    /// externally visible happened yet, so the commit is retried as-is.
    async fn commit(&mut self, next: EmergencyRequest, event: DispatchEvent) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self.store.commit_transition(&next, &event).await {
                Ok(()) => {
                    self.request = next;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Commit {} for request {} failed (attempt {}/{}): {}",
                        event.event_type(),
                        next.request_id,
                        attempt,
                        COMMIT_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                    if attempt < COMMIT_ATTEMPTS {
                        tokio::time::sleep(COMMIT_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| LifelineError::Internal("transition commit failed".to_string())))
    }

    async fn commit_accept(&mut self, provider_id: Uuid, distance_km: f64) -> Result<()> {
        let mut next = self.request.with_status(RequestStatus::Accepted)?;
        next.assigned_provider_id = Some(provider_id);
        let event = DispatchEvent::Accepted {
            request_id: self.request.request_id,
            provider_id,
            distance_km,
            radius_km: next.search_radius_km,
        };
        self.commit(next, event).await?;

        if let Err(e) = self.geo.set_availability(provider_id, Availability::Assigned) {
            warn!("Could not mark provider {} assigned: {}", provider_id, e);
        }
        info!(
            "Request {} accepted by {} at {:.2}km",
            self.request.request_id, provider_id, distance_km
        );
        Ok(())
    }

    async fn announce_winner(
        &mut self,
        winner: Uuid,
        distance_km: f64,
        undecided: &HashMap<Uuid, f64>,
    ) {
        let assigned = ChannelMessage::Assigned {
            request_id: self.request.request_id,
            provider_id: winner,
            distance_km,
        };
        // The requester must learn the outcome; the winner copy is a courtesy
        if let Err(e) = self.channel.send(self.requester_session(), assigned.clone()).await {
            warn!(
                "Could not deliver assignment to requester {}: {}",
                self.request.requester_id, e
            );
        }
        self.notify(SessionId(winner), assigned).await;

        for provider_id in undecided.keys() {
            self.notify(
                SessionId(*provider_id),
                ChannelMessage::RequestTaken {
                    request_id: self.request.request_id,
                },
            )
            .await;
        }
    }

    async fn escalate(&mut self) {
        self.request.search_radius_km += self.config.radius_step_km;
        info!(
            "Request {}: expanding search to {:.1}km",
            self.request.request_id, self.request.search_radius_km
        );
        self.notify(
            self.requester_session(),
            ChannelMessage::SearchExpanded {
                request_id: self.request.request_id,
                radius_km: self.request.search_radius_km,
            },
        )
        .await;
    }

    async fn finish_no_providers(&mut self) -> Result<()> {
        let next = self.request.with_status(RequestStatus::NoProvidersAvailable)?;
        let event = DispatchEvent::NoProviders {
            request_id: self.request.request_id,
            final_radius_km: next.search_radius_km,
            rounds: self.rounds_started,
        };
        self.commit(next, event).await?;
        self.release_assigned_provider();
        self.notify(
            self.requester_session(),
            ChannelMessage::NoProvidersAvailable {
                request_id: self.request.request_id,
            },
        )
        .await;
        info!(
            "Request {}: no providers available after {} rounds (final radius {:.1}km)",
            self.request.request_id, self.rounds_started, self.request.search_radius_km
        );
        Ok(())
    }

    async fn finish_cancelled(
        &mut self,
        cancelled_by: CancelledBy,
        undecided: &HashMap<Uuid, f64>,
    ) -> Result<()> {
        let next = self.request.with_status(RequestStatus::Cancelled)?;
        let event = DispatchEvent::Cancelled {
            request_id: self.request.request_id,
            cancelled_by,
        };
        self.commit(next, event).await?;
        self.release_assigned_provider();

        // Revoke in-flight offers
        for provider_id in undecided.keys() {
            self.notify(
                SessionId(*provider_id),
                ChannelMessage::RequestTaken {
                    request_id: self.request.request_id,
                },
            )
            .await;
        }
        let notice = ChannelMessage::RequestCancelled {
            request_id: self.request.request_id,
        };
        self.notify(self.requester_session(), notice.clone()).await;
        if let Some(provider_id) = self.request.assigned_provider_id {
            self.notify(SessionId(provider_id), notice).await;
        }
        info!(
            "Request {} cancelled by {}",
            self.request.request_id, cancelled_by
        );
        Ok(())
    }

    /// Abnormal terminals must never leave a provider stuck `assigned`
    fn release_assigned_provider(&self) {
        if let Some(provider_id) = self.request.assigned_provider_id {
            if let Err(e) = self.geo.set_availability(provider_id, Availability::Available) {
                warn!("Could not release provider {}: {}", provider_id, e);
            }
        }
    }

    // ==================== Channel plumbing ====================

    /// Best-effort send; delivery failures are logged, never fatal
    async fn notify(&self, session: SessionId, message: ChannelMessage) {
        if let Err(e) = self.channel.send(session, message).await {
            debug!("Notification to {} dropped: {}", session, e);
        }
    }

    async fn join_session(&mut self, session: SessionId) {
        if let Err(e) = self.channel.join(session, self.room()).await {
            debug!("Session {} could not join room: {}", session, e);
        } else {
            self.joined.insert(session);
        }
    }

    async fn cleanup_room(&mut self) {
        let room = self.room();
        for session in self.joined.drain() {
            let _ = self.channel.leave(session, room).await;
        }
    }
}

/// How the broadcast phase ended
enum PhaseEnd {
    Won(Uuid),
    Terminal,
}

impl PhaseEnd {
    fn into_winner(self) -> Option<Uuid> {
        match self {
            PhaseEnd::Won(provider_id) => Some(provider_id),
            PhaseEnd::Terminal => None,
        }
    }
}
