use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// AMQP connection URL
    pub url: String,
    /// Prefix for per-event-family topics (e.g. "lifeline.events")
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "lifeline.events".to_string()
}

/// Operational parameters for offer rounds and escalation
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Number of nearest candidates offered per round
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Search radius for the first round, in kilometers
    #[serde(default = "default_initial_radius_km")]
    pub initial_radius_km: f64,
    /// Radius increase per escalation, in kilometers
    #[serde(default = "default_radius_step_km")]
    pub radius_step_km: f64,
    /// Maximum number of escalations before giving up
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,
    /// Response window for one offer round, in seconds
    #[serde(default = "default_offer_timeout_secs")]
    pub offer_timeout_secs: u64,
}

fn default_top_k() -> usize {
    5
}

fn default_initial_radius_km() -> f64 {
    2.0
}

fn default_radius_step_km() -> f64 {
    2.0
}

fn default_max_escalations() -> u32 {
    3
}

fn default_offer_timeout_secs() -> u64 {
    20
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            initial_radius_km: default_initial_radius_km(),
            radius_step_km: default_radius_step_km(),
            max_escalations: default_max_escalations(),
            offer_timeout_secs: default_offer_timeout_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs)
    }

    /// Largest radius the request is allowed to reach
    pub fn max_radius_km(&self) -> f64 {
        self.initial_radius_km + self.radius_step_km * self.max_escalations as f64
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    /// H3 resolution for the provider grid (0-15; 7 is ~1.2km cell edge)
    #[serde(default = "default_resolution")]
    pub resolution: u8,
}

fn default_resolution() -> u8 {
    7
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
        }
    }
}

/// Outbox publisher daemon tuning
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Interval between publish cycles (default: 5s)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum entries fetched per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Base delay for exponential backoff
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    /// Maximum backoff delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Publish attempts before an entry is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    /// Interval between sweeps that re-arm failed entries
    #[serde(default = "default_rearm_interval")]
    pub rearm_interval_secs: u64,
    /// Random jitter applied to backoff delays (0.0-1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_batch_size() -> i64 {
    50
}

fn default_base_backoff() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    300
}

fn default_max_attempts() -> i32 {
    5
}

fn default_rearm_interval() -> u64 {
    300
}

fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_attempts: default_max_attempts(),
            rearm_interval_secs: default_rearm_interval(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl OutboxConfig {
    /// Exponential backoff for the given retry count, capped at the maximum
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let delay = self
            .base_backoff_secs
            .saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_secs(delay.min(self.max_backoff_secs))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("bus.topic_prefix", "lifeline.events")?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("LIFELINE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (LIFELINE_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("LIFELINE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.is_empty() {
            errors.push("database.url must be set".to_string());
        }

        if self.bus.url.is_empty() {
            errors.push("bus.url must be set".to_string());
        }

        if self.dispatch.top_k == 0 {
            errors.push("dispatch.top_k must be at least 1".to_string());
        }

        if self.dispatch.initial_radius_km <= 0.0 {
            errors.push("dispatch.initial_radius_km must be positive".to_string());
        }

        if self.dispatch.radius_step_km <= 0.0 {
            errors.push("dispatch.radius_step_km must be positive".to_string());
        }

        if self.dispatch.offer_timeout_secs == 0 {
            errors.push("dispatch.offer_timeout_secs must be at least 1".to_string());
        }

        if self.geo.resolution > 15 {
            errors.push(format!(
                "geo.resolution must be 0-15, got {}",
                self.geo.resolution
            ));
        }

        if self.outbox.max_attempts < 1 {
            errors.push("outbox.max_attempts must be at least 1".to_string());
        }

        if self.outbox.base_backoff_secs > self.outbox.max_backoff_secs {
            errors.push("outbox.base_backoff_secs must not exceed max_backoff_secs".to_string());
        }

        if !(0.0..=1.0).contains(&self.outbox.jitter_factor) {
            errors.push("outbox.jitter_factor must be between 0 and 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                url: "postgres://localhost/lifeline".to_string(),
                max_connections: 5,
            },
            bus: BusConfig {
                url: "amqp://localhost:5672".to_string(),
                topic_prefix: default_topic_prefix(),
            },
            dispatch: DispatchConfig::default(),
            geo: GeoConfig::default(),
            outbox: OutboxConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_max_radius() {
        let dispatch = DispatchConfig::default();
        // 2.0 + 2.0 * 3 = 8.0
        assert!((dispatch.max_radius_km() - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_catches_bad_values() {
        let mut cfg = test_config();
        cfg.dispatch.top_k = 0;
        cfg.dispatch.radius_step_km = -1.0;
        cfg.geo.resolution = 16;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let outbox = OutboxConfig {
            base_backoff_secs: 2,
            max_backoff_secs: 60,
            ..Default::default()
        };

        assert_eq!(outbox.backoff_duration(0), Duration::from_secs(2));
        assert_eq!(outbox.backoff_duration(1), Duration::from_secs(4));
        assert_eq!(outbox.backoff_duration(3), Duration::from_secs(16));
        assert_eq!(outbox.backoff_duration(10), Duration::from_secs(60)); // capped
    }
}
