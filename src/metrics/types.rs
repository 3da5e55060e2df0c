//! Serializable metric snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::device::CircuitStateKind;
use crate::storage::{DeviceId, QueueMetrics};

/// Device health derived from the age of its last successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceHealth {
    /// Last success under one minute ago.
    Healthy,
    /// Last success under five minutes ago.
    Warning,
    Error,
    /// Never read successfully.
    Unknown,
}

/// Rates and latency statistics since the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThroughputMetrics {
    pub points_per_second: f64,
    /// Successful device readings per second.
    pub devices_per_second: f64,
    pub total_points: u64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Latency samples currently in the window.
    pub sample_count: usize,
}

/// Per-device counters and health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMetrics {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub status: DeviceHealth,
    pub last_success: Option<DateTime<Utc>>,
    pub last_poll_duration_ms: Option<f64>,
    pub success_count: u64,
    pub error_count: u64,
    /// Percentage of successful reads, 0 when never attempted.
    pub success_rate: f64,
    pub last_error: Option<String>,
    /// Present when a device reader is attached.
    pub circuit_state: Option<CircuitStateKind>,
    pub consecutive_failures: Option<u32>,
}

/// Fleet-level acquisition view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionMetrics {
    pub timestamp: DateTime<Utc>,
    pub throughput: ThroughputMetrics,
    pub devices: Vec<DeviceMetrics>,
    /// Present when a writer is attached.
    pub queue: Option<QueueMetrics>,
}

/// Process-level summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub total_readings: u64,
    pub successful_readings: u64,
    pub failed_readings: u64,
    pub success_rate: f64,
    pub total_points: u64,
    pub points_per_second: f64,
    pub tracked_devices: usize,
    pub queue: Option<QueueMetrics>,
}
