pub mod alert;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod outbox;
pub mod store;

pub use alert::{Alert, AlertSeverity, AlertSink, LogAlertSink};
pub use config::{AppConfig, BusConfig, DispatchConfig, GeoConfig, OutboxConfig};
pub use dispatch::{
    ChannelMessage, CoordinatorHandle, DispatchCommand, DispatchCoordinator, DispatchService,
    LocalChannelHub, RealtimeChannel, RoomKey, SessionId,
};
pub use domain::{
    Availability, CancelledBy, Capability, DispatchEvent, EmergencyRequest, EventType, GeoPoint,
    OutboxEntry, OutboxStatus, ProviderRecord, RequestStatus, RequestSubmission,
};
pub use error::{LifelineError, Result};
pub use geo::{GeoIndex, RankedCandidate, Ranker};
pub use ingest::{FeedMessage, LocationFeed};
pub use outbox::{MessageBus, OutboxPublisher, PublisherStats, RabbitMqBus};
pub use store::{DispatchStore, MemoryStore, PostgresStore};
