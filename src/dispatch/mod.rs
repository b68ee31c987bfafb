//! Real-time dispatch: offer broadcast, acceptance racing, escalation.

pub mod channel;
pub mod coordinator;
pub mod messages;
pub mod service;

pub use channel::{LocalChannelHub, RealtimeChannel};
pub use coordinator::{CoordinatorHandle, DispatchCoordinator};
pub use messages::{ChannelMessage, DispatchCommand, RoomKey, SessionId};
pub use service::DispatchService;
