//! Configuration module for the meterwatch service.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database settings (URL, pool size)
//! - Acquisition, writer, retention and circuit breaker tuning
//! - The device fleet and its tag maps

mod app;
mod device;
mod validation;

pub use app::{AppConfig, DEFAULT_DB_URL, DEFAULT_MAX_CONNECTIONS, DatabaseConfig, ServerConfig};
pub use device::{DeviceConfig, TagConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration};
