//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::storage::actor::{WriterActor, WriterConfig};
use crate::storage::db::SqlitePool;
use crate::storage::schema::init_schema;
use crate::storage::{DeviceStore, MeasurementStore, MeasurementWriter, StorageError};

/// Default maximum pool connections for file databases.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    db_url: String,
    max_connections: u32,
    writer: WriterConfig,
}

impl StorageBuilder {
    /// Create a new storage builder for a sqlx SQLite URL.
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            writer: WriterConfig::default(),
        }
    }

    /// Set the connection pool size.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the measurement writer settings.
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer = config;
        self
    }

    /// Build the storage layer and return handles.
    ///
    /// Connects the pool, initializes the schema and spawns the writer actor.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        create_parent_dir(&self.db_url)?;

        let pool = SqlitePool::connect_with_max(&self.db_url, self.max_connections).await?;
        init_schema(pool.inner()).await?;

        let measurements = MeasurementStore::new(pool.clone());
        let devices = DeviceStore::new(pool.clone());
        let (actor_handle, writer) =
            WriterActor::spawn(Arc::new(measurements.clone()), self.writer);

        Ok(StorageHandles {
            pool,
            writer,
            measurements,
            devices,
            actor_handle: Some(actor_handle),
        })
    }
}

/// Create the parent directory of a file-backed SQLite URL.
fn create_parent_dir(db_url: &str) -> Result<(), StorageError> {
    let Some(path) = db_url.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let path = path.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") {
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::Internal(format!(
                "Failed to create database directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Shared connection pool.
    pub pool: SqlitePool,
    /// Buffered measurement writer.
    pub writer: MeasurementWriter,
    /// Measurement table access (reads and retention).
    pub measurements: MeasurementStore,
    /// Device registry.
    pub devices: DeviceStore,
    actor_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StorageHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandles").finish_non_exhaustive()
    }
}

impl StorageHandles {
    /// Gracefully shutdown the storage layer.
    ///
    /// Drains the writer, waits for the actor task, then closes the pool.
    pub async fn shutdown(mut self) -> Result<(), StorageError> {
        self.writer.shutdown().await?;

        if let Some(handle) = self.actor_handle.take() {
            handle
                .await
                .map_err(|e| StorageError::Internal(format!("Failed to join writer task: {e}")))?;
        }

        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Measurement;
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("nested/roundtrip.db").display()
        );

        let handles = StorageBuilder::new(&url).build().await.unwrap();
        let points = (0..5)
            .map(|i| Measurement::new(1, "U12", f64::from(i), Utc::now()))
            .collect();
        handles.writer.write(points).unwrap();
        assert_eq!(handles.writer.flush().await.unwrap(), 5);
        assert_eq!(handles.measurements.count().await.unwrap(), 5);
        handles.shutdown().await.unwrap();

        // Data survives a reopen.
        let handles = StorageBuilder::new(&url).build().await.unwrap();
        assert_eq!(handles.measurements.count().await.unwrap(), 5);
        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_points() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("drain.db").display());

        let handles = StorageBuilder::new(&url).build().await.unwrap();
        handles
            .writer
            .write(vec![Measurement::new(3, "P_TOT", 12.5, Utc::now())])
            .unwrap();
        handles.shutdown().await.unwrap();

        let handles = StorageBuilder::new(&url).build().await.unwrap();
        assert_eq!(handles.measurements.count().await.unwrap(), 1);
        handles.shutdown().await.unwrap();
    }

    #[test]
    fn test_create_parent_dir_ignores_memory() {
        assert!(create_parent_dir("sqlite::memory:").is_ok());
    }
}
