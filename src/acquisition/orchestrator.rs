//! Acquisition loop.
//!
//! Each cycle fetches the enabled devices, filters them through the poll
//! schedule and reads the due ones concurrently, gated by a semaphore sized
//! `parallelism`. Results go to the writer and the metrics collector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::acquisition::schedule::PollSchedule;
use crate::acquisition::{AcquisitionConfig, AcquisitionError};
use crate::device::{DeviceReader, Reading};
use crate::metrics::MetricsCollector;
use crate::storage::{Device, DeviceId, DeviceRegistry, MeasurementWriter};

/// Pause after a failed cycle.
pub const CYCLE_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Consecutive cycle failures at which logging escalates.
pub const CRITICAL_ERROR_STREAK: u32 = 10;

/// Outcome of one acquisition cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Enabled devices not yet due.
    pub skipped: usize,
}

/// Loop state exposed through the API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionStatus {
    pub running: bool,
    pub parallelism: usize,
    pub cycles_completed: u64,
    pub consecutive_errors: u32,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<CycleReport>,
}

struct Inner {
    registry: Arc<dyn DeviceRegistry>,
    reader: Arc<DeviceReader>,
    writer: MeasurementWriter,
    metrics: Arc<MetricsCollector>,
    config: AcquisitionConfig,
    gate: Arc<Semaphore>,
    schedule: Mutex<PollSchedule>,
    status: Mutex<AcquisitionStatus>,
    running: AtomicBool,
}

impl Inner {
    fn schedule(&self) -> MutexGuard<'_, PollSchedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, AcquisitionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read one device while holding a concurrency slot and route the result.
    async fn poll(&self, device: Device) -> Result<Reading, AcquisitionError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| AcquisitionError::GateClosed)?;
        let reading = self.reader.read(&device).await;
        self.route(&device, &reading).await;
        Ok(reading)
    }

    async fn route(&self, device: &Device, reading: &Reading) {
        if !reading.is_success {
            let error = reading.error_message.as_deref().unwrap_or("unknown error");
            self.metrics.record_failed_reading(device.id, error);
            return;
        }

        if let Err(e) = self
            .registry
            .update_device_last_seen(device.id, reading.utc_ts)
            .await
        {
            tracing::warn!(device_id = device.id, error = %e, "Failed to update last seen");
        }

        let chunk = self.config.max_batch_points.max(1);
        for points in reading.measurements.chunks(chunk) {
            match self.writer.write(points.to_vec()) {
                Ok(outcome) if outcome.dropped > 0 => {
                    tracing::debug!(device_id = device.id, dropped = outcome.dropped, "Writer buffer overflow");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(device_id = device.id, points = points.len(), error = %e, "Failed to enqueue measurements");
                }
            }
        }

        self.metrics
            .record_successful_reading(device.id, reading.duration);
        self.metrics
            .record_measurement_points(reading.measurements.len() as u64);
    }
}

/// Drives repeating acquisition cycles over the enabled fleet.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("parallelism", &self.inner.config.parallelism)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        reader: Arc<DeviceReader>,
        writer: MeasurementWriter,
        metrics: Arc<MetricsCollector>,
        config: AcquisitionConfig,
    ) -> Self {
        let parallelism = config.parallelism.max(1);
        let schedule = PollSchedule::new(config.default_poll_interval(), config.jitter_pct);
        let status = AcquisitionStatus {
            running: true,
            parallelism,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                registry,
                reader,
                writer,
                metrics,
                gate: Arc::new(Semaphore::new(parallelism)),
                schedule: Mutex::new(schedule),
                status: Mutex::new(status),
                running: AtomicBool::new(true),
                config,
            }),
        }
    }

    pub fn reader(&self) -> &Arc<DeviceReader> {
        &self.inner.reader
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Skip cycles until [`resume`](Self::resume). The loop keeps ticking.
    pub fn pause(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Acquisition paused");
        }
    }

    pub fn resume(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::info!("Acquisition resumed");
        }
    }

    pub fn status(&self) -> AcquisitionStatus {
        let mut status = self.inner.status().clone();
        status.running = self.is_running();
        status
    }

    /// Read one device now, outside the schedule. Still bounded by `parallelism`.
    pub async fn poll_device(&self, id: DeviceId) -> Result<Reading, AcquisitionError> {
        let device = self
            .inner
            .registry
            .get_device(id)
            .await?
            .ok_or(AcquisitionError::DeviceNotFound(id))?;
        self.inner.metrics.register_device(device.id, &device.name);
        self.inner.poll(device).await
    }

    /// Run a single cycle and record its outcome in the status.
    pub async fn run_cycle(&self) -> Result<CycleReport, AcquisitionError> {
        let result = self.cycle().await;
        let mut status = self.inner.status();
        status.last_cycle_at = Some(Utc::now());
        match &result {
            Ok(report) => {
                status.cycles_completed += 1;
                status.consecutive_errors = 0;
                status.last_success_at = status.last_cycle_at;
                status.last_report = Some(*report);
            }
            Err(e) => {
                status.consecutive_errors += 1;
                status.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn cycle(&self) -> Result<CycleReport, AcquisitionError> {
        let started = Instant::now();
        let devices = self.inner.registry.get_enabled_devices().await?;
        if devices.is_empty() {
            tracing::trace!("No enabled devices");
            return Ok(CycleReport::default());
        }

        let (due, skipped) = {
            let mut schedule = self.inner.schedule();
            let (due, skipped) = schedule.due(devices, started);
            for device in &due {
                schedule.record_attempt(device, started);
            }
            (due, skipped)
        };

        let mut report = CycleReport {
            attempted: due.len(),
            skipped,
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for device in due {
            self.inner.metrics.register_device(device.id, &device.name);
            let inner = Arc::clone(&self.inner);
            tasks.spawn(async move { inner.poll(device).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(reading)) if reading.is_success => report.succeeded += 1,
                Ok(Ok(_)) => report.failed += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    report.failed += 1;
                    first_error.get_or_insert(AcquisitionError::Task(e));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::debug!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Acquisition cycle complete"
        );
        Ok(report)
    }

    /// Tick every `default_poll_interval` until `shutdown` flips to true or
    /// its sender is dropped. An in-flight cycle always completes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.default_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            parallelism = self.inner.config.parallelism,
            interval_ms = self.inner.config.default_poll_interval_ms,
            "Acquisition loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if !self.is_running() {
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                let streak = self.inner.status().consecutive_errors;
                if streak >= CRITICAL_ERROR_STREAK {
                    tracing::error!(error = %e, consecutive_errors = streak, "Acquisition failing repeatedly, check registry and storage");
                } else {
                    tracing::error!(error = %e, consecutive_errors = streak, "Acquisition cycle failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(CYCLE_ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        tracing::info!("Acquisition loop stopped");
    }
}
