//! meterwatch - power-meter telemetry acquisition
//!
//! This crate polls a fleet of field power meters, isolates failing devices
//! behind per-device circuit breakers, batch-persists measurements to SQLite,
//! trims old rows on a daily schedule and exposes runtime metrics over HTTP.
//! It can be used as a library or run with the `meterwatch` executable.
//!
//! # Architecture
//!
//! - **Device**: Protocol reads wrapped in a circuit breaker per device
//! - **Acquisition**: Bounded-concurrency poll loop over the enabled fleet
//! - **Storage**: Buffered batch writer and sqlx-backed registry/measurement stores
//! - **Metrics**: Throughput, latency percentiles and per-device health
//! - **Retention**: Batched age-based deletes on a daily schedule
//! - **Server**: JSON API over the above

pub mod acquisition;
pub mod config;
pub mod device;
pub mod metrics;
pub mod retention;
pub mod server;
pub mod storage;

pub use acquisition::{AcquisitionConfig, AcquisitionError, Orchestrator};
pub use device::{CircuitBreakerConfig, DeviceReader, Reading, WebMiClient};
pub use metrics::MetricsCollector;
pub use retention::{CleanupStats, RetentionConfig, RetentionManager};
pub use storage::{
    Device, DeviceId, Measurement, MeasurementWriter, Quality, StorageBuilder, StorageError,
    StorageHandles, TagMap, WriterConfig,
};
