//! Operator alerting for conditions that need a human.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "WARNING"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub source: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn critical(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            source: source.into(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            source: source.into(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

/// Default sink: alerts land in the structured log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Warning => warn!("[{}] {}", alert.source, alert.message),
            AlertSeverity::Critical => error!("[{}] {}", alert.source, alert.message),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Capturing sink for assertions
    #[derive(Default)]
    pub struct RecordingAlertSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl RecordingAlertSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn raised(&self) -> Vec<Alert> {
            self.alerts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn raise(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }
}
