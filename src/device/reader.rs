//! Fault-isolated device reads.
//!
//! [`DeviceReader`] wraps a [`DeviceClient`] with a bounded timeout and one
//! [`CircuitBreaker`] per device. Breakers are created lazily on the first
//! read of a device and are only mutated here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::device::breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitStateKind,
};
use crate::device::traits::{DeviceClient, DeviceError};
use crate::storage::{Device, DeviceId, DeviceRegistry, Measurement};

/// Default bound on a single device read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Result of one read attempt. Failures are carried here, never returned as errors.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub device_id: DeviceId,
    pub utc_ts: DateTime<Utc>,
    pub is_success: bool,
    pub error_message: Option<String>,
    pub measurements: Vec<Measurement>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Rejected by an open breaker without any I/O.
    pub short_circuited: bool,
}

impl Reading {
    fn success(
        device_id: DeviceId,
        utc_ts: DateTime<Utc>,
        measurements: Vec<Measurement>,
        duration: Duration,
    ) -> Self {
        Self {
            device_id,
            utc_ts,
            is_success: true,
            error_message: None,
            measurements,
            duration,
            short_circuited: false,
        }
    }

    fn failure(
        device_id: DeviceId,
        utc_ts: DateTime<Utc>,
        error: String,
        duration: Duration,
    ) -> Self {
        Self {
            device_id,
            utc_ts,
            is_success: false,
            error_message: Some(error),
            measurements: Vec::new(),
            duration,
            short_circuited: false,
        }
    }
}

/// Hands an admitted probe back to the breaker if the read is dropped
/// before it reports an outcome.
struct ProbeGuard<'a> {
    reader: &'a DeviceReader,
    device_id: DeviceId,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(breaker) = self.reader.lock().get_mut(&self.device_id) {
            breaker.release_probe();
            tracing::debug!(device_id = self.device_id, "Probe cancelled, breaker re-armed");
        }
    }
}

/// Reads devices through a protocol client, isolating faults per device.
pub struct DeviceReader {
    client: Arc<dyn DeviceClient>,
    registry: Arc<dyn DeviceRegistry>,
    breakers: Mutex<HashMap<DeviceId, CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
    read_timeout: Duration,
}

impl std::fmt::Debug for DeviceReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceReader")
            .field("read_timeout", &self.read_timeout)
            .field("breakers", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl DeviceReader {
    pub fn new(client: Arc<dyn DeviceClient>, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            client,
            registry,
            breakers: Mutex::new(HashMap::new()),
            breaker_config: CircuitBreakerConfig::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Perform one read of `device`.
    ///
    /// An open breaker short-circuits the read with no I/O. Dropping the
    /// future during a half-open probe leaves the breaker ready to probe again.
    pub async fn read(&self, device: &Device) -> Reading {
        let started = Instant::now();
        let utc_ts = Utc::now();

        let admission = {
            let mut breakers = self.lock();
            breakers
                .entry(device.id)
                .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()))
                .try_acquire(started)
        };

        let mut probe = None;
        match admission {
            Admission::Rejected { retry_in } => {
                tracing::trace!(device_id = device.id, ?retry_in, "Read short-circuited");
                let mut reading = Reading::failure(
                    device.id,
                    utc_ts,
                    format!("circuit open, retry in {retry_in:?}"),
                    Duration::ZERO,
                );
                reading.short_circuited = true;
                return reading;
            }
            Admission::Probe => {
                tracing::info!(device_id = device.id, device = %device.name, "Circuit half-open, probing device");
                probe = Some(ProbeGuard {
                    reader: self,
                    device_id: device.id,
                    armed: true,
                });
            }
            Admission::Allowed => {}
        }

        let result = self.read_measurements(device, utc_ts).await;
        let duration = started.elapsed();
        if let Some(guard) = probe {
            guard.disarm();
        }

        let mut breakers = self.lock();
        let breaker = breakers
            .entry(device.id)
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()));
        let before = breaker.state().kind();

        match result {
            Ok(measurements) => {
                breaker.on_success();
                if before != CircuitStateKind::Closed {
                    tracing::info!(device_id = device.id, device = %device.name, "Circuit closed");
                }
                Reading::success(device.id, utc_ts, measurements, duration)
            }
            Err(e) => {
                let message = e.to_string();
                breaker.on_failure(Instant::now(), message.clone());
                let after = breaker.state().kind();
                if after == CircuitStateKind::Open && before != CircuitStateKind::Open {
                    tracing::warn!(
                        device_id = device.id,
                        device = %device.name,
                        failures = breaker.consecutive_failures(),
                        error = %message,
                        "Circuit opened"
                    );
                } else {
                    tracing::debug!(device_id = device.id, error = %message, "Device read failed");
                }
                Reading::failure(device.id, utc_ts, message, duration)
            }
        }
    }

    async fn read_measurements(
        &self,
        device: &Device,
        utc_ts: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, DeviceError> {
        let tags = self.registry.get_tag_mappings(device.id).await?;
        if tags.is_empty() {
            return Err(DeviceError::NoTags);
        }

        let values = tokio::time::timeout(self.read_timeout, self.client.read(device, &tags))
            .await
            .map_err(|_| DeviceError::Timeout(self.read_timeout))??;

        let measurements = tags
            .iter()
            .map(
                |tag| match values.get(&tag.address_key).copied().flatten() {
                    Some(raw) => Measurement::new(device.id, &tag.signal, tag.apply_scale(raw), utc_ts),
                    None => Measurement::missing(device.id, &tag.signal, utc_ts),
                },
            )
            .collect();
        Ok(measurements)
    }

    /// Connectivity check. False without I/O while the breaker is open.
    pub async fn is_healthy(&self, device: &Device) -> bool {
        if self.circuit_state(device.id) == CircuitStateKind::Open {
            return false;
        }
        matches!(
            tokio::time::timeout(self.read_timeout, self.client.probe(device)).await,
            Ok(Ok(()))
        )
    }

    /// Breaker state; `Closed` for devices never read.
    pub fn circuit_state(&self, device_id: DeviceId) -> CircuitStateKind {
        self.lock()
            .get(&device_id)
            .map(|b| b.state().kind())
            .unwrap_or(CircuitStateKind::Closed)
    }

    /// Consecutive failures recorded by the breaker.
    pub fn error_count(&self, device_id: DeviceId) -> u32 {
        self.lock()
            .get(&device_id)
            .map(CircuitBreaker::consecutive_failures)
            .unwrap_or(0)
    }

    pub fn breaker_snapshot(&self, device_id: DeviceId) -> Option<BreakerSnapshot> {
        self.lock().get(&device_id).map(CircuitBreaker::snapshot)
    }

    /// Snapshots of every breaker created so far.
    pub fn breaker_snapshots(&self) -> HashMap<DeviceId, BreakerSnapshot> {
        self.lock()
            .iter()
            .map(|(id, b)| (*id, b.snapshot()))
            .collect()
    }

    /// Close the breaker of a device. Returns false if it never had one.
    pub fn reset_circuit(&self, device_id: DeviceId) -> bool {
        match self.lock().get_mut(&device_id) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(device_id, "Circuit reset");
                true
            }
            None => false,
        }
    }
}
