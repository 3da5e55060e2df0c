//! Acquisition Layer
//!
//! The repeating poll loop over the device fleet.
//!
//! - [`Orchestrator`]: Bounded-concurrency cycles, on-demand polls and pause control
//! - [`AcquisitionConfig`]: Loop cadence and fan-out limits

mod orchestrator;
mod schedule;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DEFAULT_READ_TIMEOUT;
use crate::storage::{DeviceId, StorageError};

pub use orchestrator::{
    AcquisitionStatus, CRITICAL_ERROR_STREAK, CYCLE_ERROR_BACKOFF, CycleReport, Orchestrator,
};

/// Cycle-level failures. Device faults never surface here.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("registry error: {0}")]
    Registry(#[from] StorageError),

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("concurrency gate closed")]
    GateClosed,

    #[error("poll task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Maximum device reads in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Cycle tick and interval for devices without their own.
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,

    /// Largest chunk handed to the writer in one call.
    #[serde(default = "default_max_batch_points")]
    pub max_batch_points: usize,

    /// Relative spread applied to each device's next due time.
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,

    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

fn default_parallelism() -> usize {
    6
}

fn default_poll_interval_ms() -> u64 {
    1_500
}

fn default_max_batch_points() -> usize {
    1_000
}

fn default_jitter_pct() -> f64 {
    0.1
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            default_poll_interval_ms: default_poll_interval_ms(),
            max_batch_points: default_max_batch_points(),
            jitter_pct: default_jitter_pct(),
            read_timeout: default_read_timeout(),
        }
    }
}

impl AcquisitionConfig {
    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_millis(self.default_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: AcquisitionConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AcquisitionConfig::default());
        assert_eq!(config.parallelism, 6);
        assert_eq!(config.default_poll_interval(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_humantime_read_timeout() {
        let config: AcquisitionConfig =
            serde_yaml::from_str("parallelism: 2\nread_timeout: 2s 500ms").unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.read_timeout, Duration::from_millis(2_500));
    }
}
