//! Storage seams used by the acquisition engine.
//!
//! The engine talks to persistence only through these traits so that the
//! writer, reader and retention sweep can be driven by in-memory fakes in
//! tests. SQLite implementations live in [`MeasurementStore`] and
//! [`DeviceStore`].
//!
//! [`MeasurementStore`]: crate::storage::MeasurementStore
//! [`DeviceStore`]: crate::storage::DeviceStore

use chrono::{DateTime, Utc};

use crate::storage::StorageError;
use crate::storage::types::{Device, DeviceId, Measurement, TagMap};

/// Bulk insert target for the measurement writer.
#[async_trait::async_trait]
pub trait MeasurementSink: Send + Sync + 'static {
    /// Insert all points atomically. Either every point is stored or none is.
    async fn insert_batch(&self, batch: &[Measurement]) -> Result<(), StorageError>;
}

/// Row counting and bounded deletes for the retention sweep.
#[async_trait::async_trait]
pub trait RetentionStore: Send + Sync + 'static {
    /// Rows with `utc_ts < cutoff`.
    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Rows with `utc_ts >= cutoff`.
    async fn count_at_or_after(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Delete at most `limit` rows with `utc_ts < cutoff`, returning the number deleted.
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, StorageError>;
}

/// Device and tag lookup used by the reader and orchestrator.
#[async_trait::async_trait]
pub trait DeviceRegistry: Send + Sync + 'static {
    async fn get_enabled_devices(&self) -> Result<Vec<Device>, StorageError>;

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StorageError>;

    /// Enabled tag mappings for one device.
    async fn get_tag_mappings(&self, id: DeviceId) -> Result<Vec<TagMap>, StorageError>;

    async fn update_device_last_seen(
        &self,
        id: DeviceId,
        ts: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}
