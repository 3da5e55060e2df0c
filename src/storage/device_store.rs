//! Device registry storage and synchronization.
//!
//! Provides CRUD operations for devices and their tag maps, and the sync
//! logic that seeds the registry from the configuration file on startup.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::traits::DeviceRegistry;
use crate::storage::types::{Device, DeviceId, TagMap};

// =============================================================================
// Types
// =============================================================================

/// Tag definition used when seeding the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub signal: String,
    pub address_key: String,
    pub unit: Option<String>,
    pub scale: f64,
    pub enabled: bool,
}

/// Device definition used when seeding the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Explicit id; assigned by the database when `None`.
    pub id: Option<DeviceId>,
    /// Unique device name.
    pub name: String,
    pub address: String,
    pub protocol: String,
    pub enabled: bool,
    pub poll_interval_ms: Option<u64>,
    pub tags: Vec<TagRecord>,
}

/// Sync result for config-file devices.
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Number of devices added.
    pub added: usize,
    /// Number of devices updated.
    pub updated: usize,
    /// Number of stale devices deleted.
    pub deleted: usize,
}

type DeviceRow = (i64, String, String, String, bool, Option<i64>, Option<i64>);

fn device_from_row(row: DeviceRow) -> Device {
    let (id, name, address, protocol, enabled, poll_interval_ms, last_seen) = row;
    Device {
        id,
        name,
        address,
        protocol,
        enabled,
        poll_interval_ms: poll_interval_ms.and_then(|ms| u64::try_from(ms).ok()),
        last_seen: last_seen.and_then(DateTime::from_timestamp_micros),
    }
}

const DEVICE_COLUMNS: &str = "id, name, address, protocol, enabled, poll_interval_ms, last_seen";

// =============================================================================
// Device Store
// =============================================================================

/// Device storage facade for CRUD operations.
#[derive(Clone)]
pub struct DeviceStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStore").finish_non_exhaustive()
    }
}

impl DeviceStore {
    /// Create a new device store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a device and replace its tag maps.
    ///
    /// Returns the device ID.
    pub async fn upsert(&self, record: &DeviceRecord) -> Result<DeviceId, StorageError> {
        let poll_interval_ms = record
            .poll_interval_ms
            .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX));

        let mut tx = self.pool.inner().begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO devices (id, name, address, protocol, enabled, poll_interval_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                address = excluded.address,
                protocol = excluded.protocol,
                enabled = excluded.enabled,
                poll_interval_ms = excluded.poll_interval_ms
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.address)
        .bind(&record.protocol)
        .bind(record.enabled)
        .bind(poll_interval_ms)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tag_maps WHERE device_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for tag in &record.tags {
            sqlx::query(
                "INSERT INTO tag_maps (device_id, signal, address_key, unit, scale, enabled)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&tag.signal)
            .bind(&tag.address_key)
            .bind(tag.unit.as_deref())
            .bind(tag.scale)
            .bind(tag.enabled)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Delete a device by name. Its tag maps are removed with it.
    pub async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM devices WHERE name = ?")
            .bind(name)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List all devices.
    pub async fn list_all(&self) -> Result<Vec<Device>, StorageError> {
        let rows: Vec<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id"))
                .fetch_all(self.pool.inner())
                .await?;
        Ok(rows.into_iter().map(device_from_row).collect())
    }

    /// Sync config-file devices.
    ///
    /// - Upserts all provided devices (matched by name)
    /// - Deletes stale devices not in the provided list
    pub async fn sync_from_config(
        &self,
        records: &[DeviceRecord],
    ) -> Result<SyncResult, StorageError> {
        let mut result = SyncResult::default();

        let existing: HashSet<String> = self
            .list_all()
            .await?
            .into_iter()
            .map(|d| d.name)
            .collect();
        let wanted: HashSet<&str> = records.iter().map(|r| r.name.as_str()).collect();

        for record in records {
            self.upsert(record).await?;
            if existing.contains(&record.name) {
                result.updated += 1;
            } else {
                result.added += 1;
            }
        }

        for name in existing.iter().filter(|n| !wanted.contains(n.as_str())) {
            if self.delete(name).await? {
                result.deleted += 1;
            }
        }

        Ok(result)
    }
}

#[async_trait::async_trait]
impl DeviceRegistry for DeviceStore {
    async fn get_enabled_devices(&self) -> Result<Vec<Device>, StorageError> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE enabled = 1 ORDER BY id"
        ))
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows.into_iter().map(device_from_row).collect())
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StorageError> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.pool.inner())
                .await?;
        Ok(row.map(device_from_row))
    }

    async fn get_tag_mappings(&self, id: DeviceId) -> Result<Vec<TagMap>, StorageError> {
        let rows: Vec<(i64, String, String, Option<String>, f64, bool)> = sqlx::query_as(
            "SELECT device_id, signal, address_key, unit, scale, enabled FROM tag_maps
             WHERE device_id = ? AND enabled = 1 ORDER BY signal",
        )
        .bind(id)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(device_id, signal, address_key, unit, scale, enabled)| TagMap {
                    device_id,
                    signal,
                    address_key,
                    unit,
                    scale,
                    enabled,
                },
            )
            .collect())
    }

    async fn update_device_last_seen(
        &self,
        id: DeviceId,
        ts: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
            .bind(ts.timestamp_micros())
            .bind(id)
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;

    async fn create_test_store() -> DeviceStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(pool.inner()).await.unwrap();
        DeviceStore::new(pool)
    }

    fn record(name: &str, tags: &[(&str, &str)]) -> DeviceRecord {
        DeviceRecord {
            id: None,
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            protocol: "webmi".to_string(),
            enabled: true,
            poll_interval_ms: None,
            tags: tags
                .iter()
                .map(|(signal, key)| TagRecord {
                    signal: signal.to_string(),
                    address_key: key.to_string(),
                    unit: None,
                    scale: 1.0,
                    enabled: true,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_device_crud() {
        let store = create_test_store().await;

        let id = store
            .upsert(&record("meter-1", &[("U12", "AI.U12"), ("I1", "AI.I1")]))
            .await
            .unwrap();
        assert!(id > 0);

        let device = store.get_device(id).await.unwrap().unwrap();
        assert_eq!(device.name, "meter-1");
        assert!(device.enabled);
        assert_eq!(store.get_tag_mappings(id).await.unwrap().len(), 2);

        // Upsert by name keeps the id and replaces tags.
        let mut updated = record("meter-1", &[("U12", "AI.U12")]);
        updated.poll_interval_ms = Some(5_000);
        assert_eq!(store.upsert(&updated).await.unwrap(), id);
        let device = store.get_device(id).await.unwrap().unwrap();
        assert_eq!(device.poll_interval_ms, Some(5_000));
        assert_eq!(store.get_tag_mappings(id).await.unwrap().len(), 1);

        updated.enabled = false;
        store.upsert(&updated).await.unwrap();
        assert!(store.get_enabled_devices().await.unwrap().is_empty());

        assert!(store.delete("meter-1").await.unwrap());
        assert!(store.get_device(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_tags_are_filtered() {
        let store = create_test_store().await;
        let mut rec = record("meter-1", &[("U12", "AI.U12"), ("I1", "AI.I1")]);
        rec.tags[1].enabled = false;
        let id = store.upsert(&rec).await.unwrap();

        let tags = store.get_tag_mappings(id).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].signal, "U12");
    }

    #[tokio::test]
    async fn test_update_last_seen() {
        let store = create_test_store().await;
        let id = store.upsert(&record("meter-1", &[])).await.unwrap();
        let ts = DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap();

        store.update_device_last_seen(id, ts).await.unwrap();
        let device = store.get_device(id).await.unwrap().unwrap();
        assert_eq!(device.last_seen, Some(ts));
    }

    #[tokio::test]
    async fn test_device_sync() {
        let store = create_test_store().await;

        let result = store
            .sync_from_config(&[record("meter-1", &[]), record("meter-2", &[])])
            .await
            .unwrap();
        assert_eq!(result.added, 2);
        assert_eq!(result.updated, 0);
        assert_eq!(result.deleted, 0);

        let result = store
            .sync_from_config(&[record("meter-1", &[]), record("meter-3", &[])])
            .await
            .unwrap();
        assert_eq!(result.added, 1);
        assert_eq!(result.updated, 1);
        assert_eq!(result.deleted, 1);

        let names: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["meter-1", "meter-3"]);
    }
}
