//! SQLite measurement table access.
//!
//! Implements [`MeasurementSink`] for the writer actor and [`RetentionStore`]
//! for the retention sweep.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::traits::{MeasurementSink, RetentionStore};
use crate::storage::types::{DeviceId, Measurement, Quality};

/// Rows per multi-value INSERT statement (6 binds per row).
const INSERT_CHUNK_ROWS: usize = 1_000;

/// Measurement storage facade.
#[derive(Clone)]
pub struct MeasurementStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for MeasurementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementStore").finish_non_exhaustive()
    }
}

impl MeasurementStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Total number of stored rows.
    pub async fn count(&self) -> Result<u64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM measurements")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.0.max(0) as u64)
    }

    /// Most recent measurements for a device, newest first.
    pub async fn latest_for_device(
        &self,
        device_id: DeviceId,
        limit: u32,
    ) -> Result<Vec<Measurement>, StorageError> {
        let rows: Vec<(i64, String, f64, i64, i64)> = sqlx::query_as(
            "SELECT device_id, signal, value, quality, utc_ts FROM measurements
             WHERE device_id = ? ORDER BY utc_ts DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(i64::from(limit))
        .fetch_all(self.pool.inner())
        .await?;

        rows.into_iter()
            .map(|(device_id, signal, value, quality, utc_ts)| {
                let quality = Quality::from_code(quality).ok_or_else(|| {
                    StorageError::InvalidData(format!("unknown quality code {quality}"))
                })?;
                Ok(Measurement {
                    device_id,
                    signal,
                    value,
                    quality,
                    utc_ts: DateTime::from_timestamp_micros(utc_ts).unwrap_or(DateTime::UNIX_EPOCH),
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl MeasurementSink for MeasurementStore {
    async fn insert_batch(&self, batch: &[Measurement]) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let ingest_ts = Utc::now().timestamp_micros();
        let mut tx = self.pool.inner().begin().await?;

        for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "INSERT INTO measurements (device_id, signal, value, quality, utc_ts, ingest_ts) ",
            );
            qb.push_values(chunk, |mut row, m| {
                row.push_bind(m.device_id)
                    .push_bind(m.signal.as_str())
                    .push_bind(m.value)
                    .push_bind(m.quality.code())
                    .push_bind(m.utc_ts.timestamp_micros())
                    .push_bind(ingest_ts);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::debug!(count = batch.len(), "Measurement batch inserted");
        Ok(())
    }
}

#[async_trait::async_trait]
impl RetentionStore for MeasurementStore {
    async fn count_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM measurements WHERE utc_ts < ?")
            .bind(cutoff.timestamp_micros())
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.0.max(0) as u64)
    }

    async fn count_at_or_after(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM measurements WHERE utc_ts >= ?")
            .bind(cutoff.timestamp_micros())
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.0.max(0) as u64)
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "DELETE FROM measurements WHERE rowid IN (
                 SELECT rowid FROM measurements WHERE utc_ts < ? LIMIT ?
             )",
        )
        .bind(cutoff.timestamp_micros())
        .bind(limit)
        .execute(self.pool.inner())
        .await?;
        Ok(result.rows_affected())
    }
}
