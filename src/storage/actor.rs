//! Measurement writer actor.
//!
//! Single-writer pattern: one tokio task owns the flush path and drains a
//! shared, bounded buffer into the [`MeasurementSink`]. Producers append to
//! the buffer directly without waiting on I/O.
//!
//! A flush is triggered when the buffer reaches `min_batch_size` points or
//! when `max_flush_interval` has elapsed since the oldest unflushed point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::storage::facades::MeasurementWriter;
use crate::storage::traits::MeasurementSink;
use crate::storage::types::Measurement;

// =============================================================================
// Constants
// =============================================================================

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1_000;
pub const DEFAULT_MIN_BATCH_SIZE: usize = 250;
pub const DEFAULT_MAX_FLUSH_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BULK_BATCH_SIZE: usize = 1_000;

/// Capacity of the control channel (flush/shutdown requests only).
const COMMAND_CHANNEL_CAPACITY: usize = 16;

fn default_max_buffer_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}

fn default_min_batch_size() -> usize {
    DEFAULT_MIN_BATCH_SIZE
}

fn default_max_flush_interval() -> Duration {
    DEFAULT_MAX_FLUSH_INTERVAL
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_max_retry_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}

fn default_retry_base_delay() -> Duration {
    DEFAULT_RETRY_BASE_DELAY
}

fn default_bulk_batch_size() -> usize {
    DEFAULT_BULK_BATCH_SIZE
}

// =============================================================================
// Configuration
// =============================================================================

/// What to do with new points when the buffer is at capacity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered points to make room.
    #[default]
    DropOldest,
    /// Refuse the incoming points.
    Reject,
}

/// Measurement writer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Hard cap on unflushed points.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Buffer size that triggers an immediate flush.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    /// Maximum age of the oldest unflushed point.
    #[serde(default = "default_max_flush_interval", with = "humantime_serde")]
    pub max_flush_interval: Duration,
    /// Timeout applied to every bulk insert attempt.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Total attempts per batch, including the first.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Maximum points per bulk insert.
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_batch_size: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_flush_interval: DEFAULT_MAX_FLUSH_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            bulk_batch_size: DEFAULT_BULK_BATCH_SIZE,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl WriterConfig {
    /// Delay before retry number `attempt` (1-based count of failed attempts).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay.saturating_mul(factor)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Control commands sent to the writer actor.
#[derive(Debug)]
pub enum Command {
    /// Flush everything buffered; replies with the number of points written.
    Flush(oneshot::Sender<usize>),
    /// Drain the buffer and stop.
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// Buffer
// =============================================================================

/// Result of appending points to the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub accepted: usize,
    /// Points evicted or rejected because of the capacity cap.
    pub dropped: usize,
}

/// Bounded FIFO of unflushed points with size and age triggers.
#[derive(Debug)]
pub(crate) struct BatchBuffer {
    items: VecDeque<Measurement>,
    oldest_at: Option<Instant>,
    max_size: usize,
    min_batch: usize,
    flush_interval: Duration,
    policy: OverflowPolicy,
    overflowing: bool,
}

impl BatchBuffer {
    pub(crate) fn new(config: &WriterConfig) -> Self {
        Self {
            items: VecDeque::with_capacity(config.max_buffer_size),
            oldest_at: None,
            max_size: config.max_buffer_size.max(1),
            min_batch: config.min_batch_size.max(1),
            flush_interval: config.max_flush_interval,
            policy: config.overflow_policy,
            overflowing: false,
        }
    }

    pub(crate) fn push_all(&mut self, points: Vec<Measurement>, now: Instant) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        for point in points {
            if self.items.len() >= self.max_size {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        self.items.pop_front();
                        outcome.dropped += 1;
                    }
                    OverflowPolicy::Reject => {
                        outcome.dropped += 1;
                        continue;
                    }
                }
            }
            // Start the age clock on the first point of an empty buffer.
            if self.items.is_empty() {
                self.oldest_at = Some(now);
            }
            self.items.push_back(point);
            outcome.accepted += 1;
        }

        if outcome.dropped > 0 && !self.overflowing {
            self.overflowing = true;
            tracing::warn!(
                dropped = outcome.dropped,
                max_buffer_size = self.max_size,
                policy = %self.policy,
                "Measurement buffer full, dropping points"
            );
        }
        outcome
    }

    pub(crate) fn should_flush(&self, now: Instant) -> bool {
        self.items.len() >= self.min_batch
            || self
                .oldest_at
                .is_some_and(|t| now.saturating_duration_since(t) >= self.flush_interval)
    }

    /// Instant at which the age trigger fires, if anything is buffered.
    pub(crate) fn flush_deadline(&self) -> Option<Instant> {
        self.oldest_at.map(|t| t + self.flush_interval)
    }

    /// Remove up to `max` points from the front.
    pub(crate) fn take(&mut self, max: usize) -> Vec<Measurement> {
        let n = max.max(1).min(self.items.len());
        let batch: Vec<_> = self.items.drain(..n).collect();
        if self.items.is_empty() {
            self.oldest_at = None;
        }
        if self.items.len() < self.max_size {
            self.overflowing = false;
        }
        batch
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// Counters shared between the actor and its facades.
#[derive(Debug, Default)]
pub(crate) struct WriterStats {
    pub flushed_points: AtomicU64,
    pub flushes: AtomicU64,
    pub dropped_points: AtomicU64,
    pub lost_points: AtomicU64,
    /// Points taken from the buffer and currently being written.
    pub in_flight: AtomicUsize,
}

/// State shared by the actor and every [`MeasurementWriter`] clone.
#[derive(Debug)]
pub(crate) struct Shared {
    buffer: Mutex<BatchBuffer>,
    pub notify: Notify,
    pub stats: WriterStats,
    pub max_buffer_size: usize,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BatchBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Writer actor draining the shared buffer into a sink.
pub struct WriterActor {
    sink: Arc<dyn MeasurementSink>,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Command>,
    config: WriterConfig,
}

impl WriterActor {
    /// Spawn the writer task.
    ///
    /// Returns the task handle and the producer facade.
    pub fn spawn(
        sink: Arc<dyn MeasurementSink>,
        config: WriterConfig,
    ) -> (JoinHandle<()>, MeasurementWriter) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(BatchBuffer::new(&config)),
            notify: Notify::new(),
            stats: WriterStats::default(),
            max_buffer_size: config.max_buffer_size.max(1),
        });

        let actor = WriterActor {
            sink,
            shared: Arc::clone(&shared),
            rx,
            config,
        };
        let handle = tokio::spawn(actor.run());

        (handle, MeasurementWriter::new(tx, shared))
    }

    async fn run(mut self) {
        tracing::info!(
            min_batch_size = self.config.min_batch_size,
            max_buffer_size = self.config.max_buffer_size,
            "Measurement writer started"
        );

        loop {
            let deadline = self.shared.lock().flush_deadline();
            let age_trigger = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Flush(reply)) => {
                        let written = self.flush_all().await;
                        let _ = reply.send(written);
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.flush_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        tracing::warn!("Writer channel closed, draining buffer");
                        self.flush_all().await;
                        break;
                    }
                },
                _ = self.shared.notify.notified() => self.flush_ready().await,
                _ = age_trigger => self.flush_ready().await,
            }
        }

        tracing::info!("Measurement writer stopped");
    }

    /// Flush while either trigger holds.
    async fn flush_ready(&mut self) {
        loop {
            let batch = {
                let mut buffer = self.shared.lock();
                if !buffer.should_flush(Instant::now()) {
                    return;
                }
                self.take_batch(&mut buffer)
            };
            self.write_batch(batch).await;
        }
    }

    /// Flush everything currently buffered. Returns points written.
    async fn flush_all(&mut self) -> usize {
        let mut written = 0;
        loop {
            let batch = {
                let mut buffer = self.shared.lock();
                if buffer.is_empty() {
                    return written;
                }
                self.take_batch(&mut buffer)
            };
            written += self.write_batch(batch).await;
        }
    }

    fn take_batch(&self, buffer: &mut BatchBuffer) -> Vec<Measurement> {
        let batch = buffer.take(self.config.bulk_batch_size);
        self.shared
            .stats
            .in_flight
            .fetch_add(batch.len(), Ordering::Relaxed);
        batch
    }

    /// Write one batch with bounded retries. Returns points written (0 if lost).
    async fn write_batch(&self, batch: Vec<Measurement>) -> usize {
        let count = batch.len();
        let attempts = self.config.max_retry_attempts.max(1);
        let stats = &self.shared.stats;

        let mut written = 0;
        for attempt in 1..=attempts {
            let result =
                tokio::time::timeout(self.config.command_timeout, self.sink.insert_batch(&batch))
                    .await;

            match result {
                Ok(Ok(())) => {
                    stats
                        .flushed_points
                        .fetch_add(count as u64, Ordering::Relaxed);
                    stats.flushes.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(count, attempt, "Measurement batch flushed");
                    written = count;
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, count, attempt, attempts, "Batch insert failed");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout = ?self.config.command_timeout,
                        count,
                        attempt,
                        attempts,
                        "Batch insert timed out"
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }

        if written == 0 {
            stats.lost_points.fetch_add(count as u64, Ordering::Relaxed);
            tracing::error!(lost = count, attempts, "Measurement batch lost after retries");
        }
        stats.in_flight.fetch_sub(count, Ordering::Relaxed);
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use chrono::Utc;

    /// Sink recording batches, failing the first `fail_first` calls.
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<Measurement>>>,
        fail_first: AtomicUsize,
        calls: AtomicUsize,
    }

    impl RecordingSink {
        fn failing(n: usize) -> Self {
            Self {
                fail_first: AtomicUsize::new(n),
                ..Default::default()
            }
        }

        fn total(&self) -> usize {
            self.batches.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    #[async_trait::async_trait]
    impl MeasurementSink for RecordingSink {
        async fn insert_batch(&self, batch: &[Measurement]) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Internal("disk unavailable".to_string()));
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn points(n: usize) -> Vec<Measurement> {
        let now = Utc::now();
        (0..n)
            .map(|i| Measurement::new(1, format!("S{i}"), i as f64, now))
            .collect()
    }

    fn config(min_batch: usize, interval: Duration) -> WriterConfig {
        WriterConfig {
            min_batch_size: min_batch,
            max_flush_interval: interval,
            retry_base_delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_buffer_drop_oldest() {
        let cfg = WriterConfig {
            max_buffer_size: 10,
            ..Default::default()
        };
        let mut buffer = BatchBuffer::new(&cfg);
        let outcome = buffer.push_all(points(15), Instant::now());

        assert_eq!(outcome, PushOutcome { accepted: 15, dropped: 5 });
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.take(1)[0].signal, "S5");
    }

    #[test]
    fn test_buffer_reject() {
        let cfg = WriterConfig {
            max_buffer_size: 10,
            overflow_policy: OverflowPolicy::Reject,
            ..Default::default()
        };
        let mut buffer = BatchBuffer::new(&cfg);
        let outcome = buffer.push_all(points(15), Instant::now());

        assert_eq!(outcome, PushOutcome { accepted: 10, dropped: 5 });
        assert_eq!(buffer.take(1)[0].signal, "S0");
    }

    #[test]
    fn test_buffer_triggers() {
        let cfg = config(5, Duration::from_secs(5));
        let mut buffer = BatchBuffer::new(&cfg);
        let start = Instant::now();

        assert!(!buffer.should_flush(start));
        assert_eq!(buffer.flush_deadline(), None);

        buffer.push_all(points(2), start);
        assert!(!buffer.should_flush(start + Duration::from_secs(4)));
        assert!(buffer.should_flush(start + Duration::from_secs(5)));

        buffer.push_all(points(3), start);
        assert!(buffer.should_flush(start));

        assert_eq!(buffer.take(100).len(), 5);
        assert!(buffer.is_empty());
        assert_eq!(buffer.flush_deadline(), None);
    }

    #[test]
    fn test_retry_delay_doubles() {
        let cfg = WriterConfig::default();
        assert_eq!(cfg.retry_delay(1), Duration::from_millis(1_000));
        assert_eq!(cfg.retry_delay(2), Duration::from_millis(2_000));
        assert_eq!(cfg.retry_delay(3), Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_min_batch_before_interval() {
        let sink = Arc::new(RecordingSink::default());
        let (_handle, writer) = WriterActor::spawn(sink.clone(), config(5, Duration::from_secs(60)));

        writer.write(points(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.total(), 5);
        assert_eq!(writer.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval_below_min_batch() {
        let sink = Arc::new(RecordingSink::default());
        let (_handle, writer) = WriterActor::spawn(sink.clone(), config(250, Duration::from_secs(5)));

        writer.write(points(3)).unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(sink.total(), 0);
        assert_eq!(writer.buffered(), 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.total(), 3);
        assert_eq!(writer.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let sink = Arc::new(RecordingSink::failing(2));
        let (_handle, writer) = WriterActor::spawn(sink.clone(), config(250, Duration::from_secs(5)));

        writer.write(points(4)).unwrap();
        assert_eq!(writer.flush().await.unwrap(), 4);

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.total(), 4);
        assert_eq!(writer.lost_points(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_batch() {
        let sink = Arc::new(RecordingSink::failing(usize::MAX));
        let (_handle, writer) = WriterActor::spawn(sink.clone(), config(250, Duration::from_secs(5)));

        writer.write(points(4)).unwrap();
        assert_eq!(writer.flush().await.unwrap(), 0);

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(writer.lost_points(), 4);
        assert_eq!(writer.queue_metrics().pending_writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_flush_is_split_into_bulk_batches() {
        let sink = Arc::new(RecordingSink::default());
        let cfg = WriterConfig {
            max_buffer_size: 5_000,
            min_batch_size: 5_000,
            bulk_batch_size: 1_000,
            ..Default::default()
        };
        let (_handle, writer) = WriterActor::spawn(sink.clone(), cfg);

        writer.write(points(2_500)).unwrap();
        assert_eq!(writer.flush().await.unwrap(), 2_500);

        let sizes: Vec<_> = sink.batches.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1_000, 1_000, 500]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffer() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, writer) = WriterActor::spawn(sink.clone(), config(250, Duration::from_secs(60)));

        writer.write(points(7)).unwrap();
        writer.shutdown().await.unwrap();
        handle.await.unwrap();

        assert_eq!(sink.total(), 7);
        assert!(writer.write(points(1)).is_err());
    }
}
