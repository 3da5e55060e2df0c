//! In-process metrics collector.
//!
//! All mutable state sits behind one mutex; the measurement point counter is
//! an atomic so the hot path in the orchestrator does not contend on it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::device::DeviceReader;
use crate::metrics::types::{
    AcquisitionMetrics, DeviceHealth, DeviceMetrics, SystemMetrics, ThroughputMetrics,
};
use crate::storage::{DeviceId, MeasurementWriter};

/// Latency samples kept in the rolling window.
pub const LATENCY_WINDOW: usize = 1_000;

const HEALTHY_WITHIN: Duration = Duration::from_secs(60);
const WARNING_WITHIN: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct DeviceCounters {
    name: Option<String>,
    success: u64,
    errors: u64,
    last_success: Option<DateTime<Utc>>,
    last_duration: Option<Duration>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct MetricsState {
    latencies: VecDeque<Duration>,
    devices: HashMap<DeviceId, DeviceCounters>,
    successful: u64,
    failed: u64,
    reset_at: Instant,
}

impl MetricsState {
    fn new(now: Instant) -> Self {
        Self {
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            devices: HashMap::new(),
            successful: 0,
            failed: 0,
            reset_at: now,
        }
    }
}

/// Sorted-index percentile: `sorted[round(p * (n - 1))]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn health(last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DeviceHealth {
    let Some(last) = last_success else {
        return DeviceHealth::Unknown;
    };
    let age = (now - last).to_std().unwrap_or(Duration::ZERO);
    if age < HEALTHY_WITHIN {
        DeviceHealth::Healthy
    } else if age < WARNING_WITHIN {
        DeviceHealth::Warning
    } else {
        DeviceHealth::Error
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

fn success_rate(success: u64, errors: u64) -> f64 {
    let total = success + errors;
    if total > 0 {
        success as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

/// Process-wide acquisition metrics.
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
    points: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
    reader: Option<Arc<DeviceReader>>,
    writer: Option<MeasurementWriter>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(MetricsState::new(now)),
            points: AtomicU64::new(0),
            started_at: Utc::now(),
            started: now,
            reader: None,
            writer: None,
        }
    }

    /// Merge breaker state from this reader into device metrics.
    pub fn with_reader(mut self, reader: Arc<DeviceReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Merge buffer depth from this writer into snapshots.
    pub fn with_writer(mut self, writer: MeasurementWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a display name to a device id.
    pub fn register_device(&self, device_id: DeviceId, name: &str) {
        let mut state = self.lock();
        let counters = state.devices.entry(device_id).or_default();
        if counters.name.as_deref() != Some(name) {
            counters.name = Some(name.to_string());
        }
    }

    pub fn record_successful_reading(&self, device_id: DeviceId, duration: Duration) {
        let mut state = self.lock();
        state.successful += 1;
        if state.latencies.len() >= LATENCY_WINDOW {
            state.latencies.pop_front();
        }
        state.latencies.push_back(duration);

        let counters = state.devices.entry(device_id).or_default();
        counters.success += 1;
        counters.last_success = Some(Utc::now());
        counters.last_duration = Some(duration);
    }

    pub fn record_failed_reading(&self, device_id: DeviceId, error: &str) {
        let mut state = self.lock();
        state.failed += 1;
        let counters = state.devices.entry(device_id).or_default();
        counters.errors += 1;
        counters.last_error = Some(error.to_string());
    }

    pub fn record_measurement_point(&self) {
        self.points.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` points at once.
    pub fn record_measurement_points(&self, n: u64) {
        self.points.fetch_add(n, Ordering::Relaxed);
    }

    /// Points per second since the last reset.
    pub fn get_throughput_rate(&self) -> f64 {
        self.throughput_rate_at(Instant::now())
    }

    pub fn throughput_rate_at(&self, now: Instant) -> f64 {
        let reset_at = self.lock().reset_at;
        rate(
            self.points.load(Ordering::Relaxed),
            now.saturating_duration_since(reset_at),
        )
    }

    /// Clear counters, samples and the rate window.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = MetricsState::new(Instant::now());
        self.points.store(0, Ordering::Relaxed);
        tracing::info!("Metrics reset");
    }

    pub fn get_throughput_metrics(&self) -> ThroughputMetrics {
        let state = self.lock();
        self.throughput_locked(&state, Instant::now())
    }

    fn throughput_locked(&self, state: &MetricsState, now: Instant) -> ThroughputMetrics {
        let elapsed = now.saturating_duration_since(state.reset_at);
        let mut samples: Vec<f64> = state
            .latencies
            .iter()
            .map(|d| d.as_secs_f64() * 1_000.0)
            .collect();
        samples.sort_by(f64::total_cmp);

        let average = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };
        let total_points = self.points.load(Ordering::Relaxed);

        ThroughputMetrics {
            points_per_second: rate(total_points, elapsed),
            devices_per_second: rate(state.successful, elapsed),
            total_points,
            average_latency_ms: average,
            p95_latency_ms: percentile(&samples, 0.95),
            p99_latency_ms: percentile(&samples, 0.99),
            sample_count: samples.len(),
        }
    }

    fn device_metrics(
        &self,
        device_id: DeviceId,
        counters: &DeviceCounters,
        now: DateTime<Utc>,
    ) -> DeviceMetrics {
        let breaker = self
            .reader
            .as_ref()
            .map(|r| (r.circuit_state(device_id), r.error_count(device_id)));

        DeviceMetrics {
            device_id,
            name: counters.name.clone(),
            status: health(counters.last_success, now),
            last_success: counters.last_success,
            last_poll_duration_ms: counters.last_duration.map(|d| d.as_secs_f64() * 1_000.0),
            success_count: counters.success,
            error_count: counters.errors,
            success_rate: success_rate(counters.success, counters.errors),
            last_error: counters.last_error.clone(),
            circuit_state: breaker.map(|(state, _)| state),
            consecutive_failures: breaker.map(|(_, failures)| failures),
        }
    }

    /// Metrics for one device, if it has been seen.
    pub fn device_snapshot(&self, device_id: DeviceId) -> Option<DeviceMetrics> {
        let state = self.lock();
        let counters = state.devices.get(&device_id)?;
        Some(self.device_metrics(device_id, counters, Utc::now()))
    }

    pub fn get_acquisition_metrics(&self) -> AcquisitionMetrics {
        let now = Utc::now();
        let (throughput, mut devices) = {
            let state = self.lock();
            let throughput = self.throughput_locked(&state, Instant::now());
            let devices: Vec<_> = state
                .devices
                .iter()
                .map(|(id, c)| self.device_metrics(*id, c, now))
                .collect();
            (throughput, devices)
        };
        devices.sort_by_key(|d| d.device_id);

        AcquisitionMetrics {
            timestamp: now,
            throughput,
            devices,
            queue: self.writer.as_ref().map(MeasurementWriter::queue_metrics),
        }
    }

    pub fn get_current_metrics(&self) -> SystemMetrics {
        let now = Instant::now();
        let state = self.lock();
        let total_points = self.points.load(Ordering::Relaxed);

        SystemMetrics {
            timestamp: Utc::now(),
            started_at: self.started_at,
            uptime_seconds: now.saturating_duration_since(self.started).as_secs_f64(),
            total_readings: state.successful + state.failed,
            successful_readings: state.successful,
            failed_readings: state.failed,
            success_rate: success_rate(state.successful, state.failed),
            total_points,
            points_per_second: rate(total_points, now.saturating_duration_since(state.reset_at)),
            tracked_devices: state.devices.len(),
            queue: self.writer.as_ref().map(MeasurementWriter::queue_metrics),
        }
    }
}
