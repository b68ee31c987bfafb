use thiserror::Error;

/// Main error type for the dispatch core
#[derive(Error, Debug)]
pub enum LifelineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Message bus errors
    #[error("Message bus error: {0}")]
    Bus(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Geospatial errors
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    // Dispatch lifecycle errors
    #[error("Request not found: {0}")]
    RequestNotFound(uuid::Uuid),

    #[error("Request is closed: {0}")]
    RequestClosed(uuid::Uuid),

    #[error("Provider not found: {0}")]
    ProviderNotFound(uuid::Uuid),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unexpected state: {0}")]
    UnexpectedState(String),

    // Realtime channel errors
    #[error("Channel delivery failed: {0}")]
    ChannelDelivery(String),

    #[error("Unexpected channel message: {0}")]
    UnexpectedMessage(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for LifelineError
pub type Result<T> = std::result::Result<T, LifelineError>;

impl From<lapin::Error> for LifelineError {
    fn from(err: lapin::Error) -> Self {
        LifelineError::Bus(err.to_string())
    }
}
