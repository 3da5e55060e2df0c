//! User-facing storage facades.
//!
//! - `MeasurementWriter`: Non-blocking buffered writes drained by the writer actor
//! - `QueueMetrics`: Snapshot of the writer's buffer and counters

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::storage::StorageError;
use crate::storage::actor::{Command, PushOutcome, Shared};
use crate::storage::types::Measurement;

/// Writer buffer and throughput counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    /// Points waiting in the buffer.
    pub buffer_size: usize,
    /// Hard cap of the buffer.
    pub max_buffer_size: usize,
    /// Points taken from the buffer and currently being inserted.
    pub pending_writes: usize,
    /// Points persisted since startup.
    pub flushed_points: u64,
    /// Points evicted or rejected by the capacity cap.
    pub dropped_points: u64,
    /// Points discarded after the retry budget was exhausted.
    pub lost_points: u64,
}

/// Non-blocking measurement writer.
///
/// Points are appended to a bounded buffer shared with the writer actor.
/// A full buffer evicts or rejects points according to the overflow policy;
/// `write` never waits on storage I/O.
#[derive(Clone)]
pub struct MeasurementWriter {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MeasurementWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementWriter")
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

impl MeasurementWriter {
    pub(crate) fn new(tx: mpsc::Sender<Command>, shared: Arc<Shared>) -> Self {
        Self { tx, shared }
    }

    /// Append points to the buffer.
    ///
    /// # Errors
    /// Returns `StorageError::ChannelSend` once the writer has shut down.
    pub fn write(&self, points: Vec<Measurement>) -> Result<PushOutcome, StorageError> {
        if self.tx.is_closed() {
            return Err(StorageError::ChannelSend);
        }
        if points.is_empty() {
            return Ok(PushOutcome::default());
        }

        let now = Instant::now();
        let (outcome, wake) = {
            let mut buffer = self.shared.lock();
            let was_empty = buffer.is_empty();
            let outcome = buffer.push_all(points, now);
            // Wake on the first point so the actor arms the age timer.
            (outcome, was_empty || buffer.should_flush(now))
        };

        if outcome.dropped > 0 {
            self.shared
                .stats
                .dropped_points
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }
        if wake {
            self.shared.notify.notify_one();
        }
        Ok(outcome)
    }

    /// Flush all buffered points and wait for completion.
    ///
    /// Returns the number of points persisted.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| StorageError::ChannelSend)?;
        rx.await
            .map_err(|_| StorageError::Internal("writer dropped flush reply".to_string()))
    }

    /// Drain the buffer and stop the writer actor.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| StorageError::ChannelSend)?;
        rx.await
            .map_err(|_| StorageError::Internal("writer dropped shutdown reply".to_string()))
    }

    /// Points currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn max_buffer_size(&self) -> usize {
        self.shared.max_buffer_size
    }

    /// Total points evicted or rejected due to buffer capacity.
    pub fn dropped_points(&self) -> u64 {
        self.shared.stats.dropped_points.load(Ordering::Relaxed)
    }

    /// Total points discarded after exhausting retries.
    pub fn lost_points(&self) -> u64 {
        self.shared.stats.lost_points.load(Ordering::Relaxed)
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        let stats = &self.shared.stats;
        QueueMetrics {
            buffer_size: self.buffered(),
            max_buffer_size: self.shared.max_buffer_size,
            pending_writes: stats.in_flight.load(Ordering::Relaxed),
            flushed_points: stats.flushed_points.load(Ordering::Relaxed),
            dropped_points: stats.dropped_points.load(Ordering::Relaxed),
            lost_points: stats.lost_points.load(Ordering::Relaxed),
        }
    }
}
