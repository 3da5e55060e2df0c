//! Storage Layer
//!
//! SQLite persistence for measurements and the device registry:
//! - **Writer**: Async actor draining a bounded buffer in batches
//! - **Stores**: sqlx-backed table access behind small traits
//!
//! # Components
//!
//! - [`MeasurementWriter`]: Non-blocking buffered write facade
//! - [`MeasurementStore`]: Bulk insert, reads and retention deletes
//! - [`DeviceStore`]: Device/tag registry CRUD and config sync
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

mod actor;
mod builder;
pub mod db;
pub mod device_store;
mod error;
mod facades;
pub mod measurement_store;
mod schema;
mod traits;
mod types;

pub use actor::{OverflowPolicy, PushOutcome, WriterActor, WriterConfig};
pub use builder::{StorageBuilder, StorageHandles};
pub use device_store::{DeviceRecord, DeviceStore, SyncResult, TagRecord};
pub use error::StorageError;
pub use facades::{MeasurementWriter, QueueMetrics};
pub use measurement_store::MeasurementStore;
pub use schema::init_schema;
pub use traits::{DeviceRegistry, MeasurementSink, RetentionStore};
pub use types::{Device, DeviceId, Measurement, Quality, TagMap};
