//! Realtime session abstraction.
//!
//! The coordinator only ever talks to the `RealtimeChannel` contract; the
//! transport (websocket gateway, push service) lives outside this crate.
//! `LocalChannelHub` is the in-process implementation used by tests and
//! single-node deployments: per-session mailboxes plus room membership
//! keyed by request.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::messages::{ChannelMessage, RoomKey, SessionId};
use crate::error::{LifelineError, Result};

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Push a message to one session. A delivery failure is reported as an
    /// error; the caller decides whether it is fatal (for offers it is not).
    async fn send(&self, session: SessionId, message: ChannelMessage) -> Result<()>;

    /// Add a session to a request-scoped room
    async fn join(&self, session: SessionId, room: RoomKey) -> Result<()>;

    /// Remove a session from a request-scoped room
    async fn leave(&self, session: SessionId, room: RoomKey) -> Result<()>;
}

#[derive(Debug, Default)]
struct HubInner {
    sessions: HashMap<SessionId, mpsc::UnboundedSender<ChannelMessage>>,
    rooms: HashMap<RoomKey, HashSet<SessionId>>,
}

/// In-process channel hub
#[derive(Debug, Default)]
pub struct LocalChannelHub {
    inner: RwLock<HubInner>,
}

impl LocalChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and get its mailbox. Re-registering replaces the
    /// previous mailbox (a reconnect).
    pub async fn register(&self, session: SessionId) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().await.sessions.insert(session, tx);
        rx
    }

    /// Drop a session and its room memberships
    pub async fn disconnect(&self, session: SessionId) {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(&session);
        for members in inner.rooms.values_mut() {
            members.remove(&session);
        }
    }

    pub async fn room_members(&self, room: RoomKey) -> Vec<SessionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a room once its request reaches a terminal state
    pub async fn close_room(&self, room: RoomKey) {
        self.inner.write().await.rooms.remove(&room);
    }
}

#[async_trait]
impl RealtimeChannel for LocalChannelHub {
    async fn send(&self, session: SessionId, message: ChannelMessage) -> Result<()> {
        let inner = self.inner.read().await;
        match inner.sessions.get(&session) {
            Some(tx) => tx.send(message).map_err(|_| {
                LifelineError::ChannelDelivery(format!("session {session} mailbox closed"))
            }),
            None => Err(LifelineError::ChannelDelivery(format!(
                "session {session} not connected"
            ))),
        }
    }

    async fn join(&self, session: SessionId, room: RoomKey) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&session) {
            return Err(LifelineError::ChannelDelivery(format!(
                "session {session} not connected"
            )));
        }
        inner.rooms.entry(room).or_default().insert(session);
        debug!("Session {} joined room {}", session, room);
        Ok(())
    }

    async fn leave(&self, session: SessionId, room: RoomKey) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.rooms.get_mut(&room) {
            members.remove(&session);
            if members.is_empty() {
                inner.rooms.remove(&room);
            }
        }
        Ok(())
    }
}
