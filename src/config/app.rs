//! Application configuration structures.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::acquisition::AcquisitionConfig;
use crate::device::CircuitBreakerConfig;
use crate::retention::RetentionConfig;
use crate::storage::{DeviceRecord, WriterConfig};

use super::device::DeviceConfig;
use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default database location.
pub const DEFAULT_DB_URL: &str = "sqlite://data/meterwatch.db";

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

fn default_db_url() -> String {
    DEFAULT_DB_URL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx SQLite URL, e.g. `sqlite://data/meterwatch.db` or `sqlite::memory:`.
    #[serde(default = "default_db_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Fleet definition synced into the registry on startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding `${VAR:-default}` first.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::invalid(format!("invalid server bind address: '{}'", self.server.bind))
        })?;
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server port must be non-zero"));
        }

        if !self.database.url.starts_with("sqlite:") {
            return Err(ConfigError::invalid(format!(
                "database url must be a sqlite URL: '{}'",
                self.database.url
            )));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid("database max_connections must be positive"));
        }

        let acq = &self.acquisition;
        if acq.parallelism == 0 {
            return Err(ConfigError::invalid("acquisition parallelism must be positive"));
        }
        if acq.default_poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "acquisition default_poll_interval_ms must be positive",
            ));
        }
        if acq.max_batch_points == 0 {
            return Err(ConfigError::invalid("acquisition max_batch_points must be positive"));
        }
        if !(0.0..1.0).contains(&acq.jitter_pct) {
            return Err(ConfigError::invalid("acquisition jitter_pct must be in [0, 1)"));
        }
        if acq.read_timeout.is_zero() {
            return Err(ConfigError::invalid("acquisition read_timeout must be positive"));
        }

        let w = &self.writer;
        if w.max_buffer_size == 0 || w.min_batch_size == 0 || w.bulk_batch_size == 0 {
            return Err(ConfigError::invalid(
                "writer buffer and batch sizes must be positive",
            ));
        }
        if w.min_batch_size > w.max_buffer_size {
            return Err(ConfigError::invalid(
                "writer min_batch_size must not exceed max_buffer_size",
            ));
        }
        if w.max_retry_attempts == 0 {
            return Err(ConfigError::invalid("writer max_retry_attempts must be at least 1"));
        }

        let r = &self.retention;
        if r.retention_days == 0 {
            return Err(ConfigError::invalid("retention_days must be positive"));
        }
        if r.cleanup_hour > 23 {
            return Err(ConfigError::invalid("retention cleanup_hour must be 0-23"));
        }
        if r.batch_size == 0 {
            return Err(ConfigError::invalid("retention batch_size must be positive"));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker failure_threshold must be positive"));
        }
        if cb.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("circuit_breaker backoff_multiplier must be >= 1"));
        }
        if cb.max_cooldown < cb.cooldown {
            return Err(ConfigError::invalid(
                "circuit_breaker max_cooldown must not be below cooldown",
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Devices as registry records for [`DeviceStore::sync_from_config`].
    ///
    /// [`DeviceStore::sync_from_config`]: crate::storage::DeviceStore::sync_from_config
    pub fn to_device_records(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(DeviceConfig::to_record).collect()
    }
}
