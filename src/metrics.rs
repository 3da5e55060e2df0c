//! Metrics Layer
//!
//! Process-wide counters and latency samples for the acquisition engine.
//!
//! - [`MetricsCollector`]: Records reads and points, produces snapshots
//! - [`SystemMetrics`] / [`AcquisitionMetrics`]: Serializable views for the HTTP API

mod collector;
mod types;

pub use collector::{LATENCY_WINDOW, MetricsCollector, percentile};
pub use types::{AcquisitionMetrics, DeviceHealth, DeviceMetrics, SystemMetrics, ThroughputMetrics};
