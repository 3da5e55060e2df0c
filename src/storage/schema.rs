//! Database schema definitions.
//!
//! Timestamps are stored as epoch microseconds (`INTEGER`).

use sqlx::SqlitePool;

use crate::storage::StorageError;

/// SQL statement for creating the devices table.
pub const DEVICES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id               INTEGER PRIMARY KEY,
    name             TEXT NOT NULL UNIQUE,
    address          TEXT NOT NULL,
    protocol         TEXT NOT NULL DEFAULT 'webmi',
    enabled          INTEGER NOT NULL DEFAULT 1,
    poll_interval_ms INTEGER,
    last_seen        INTEGER
);
"#;

/// SQL statement for creating the tag map table.
///
/// One row per (device, signal); `address_key` is the raw key read on the wire.
pub const TAG_MAPS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS tag_maps (
    device_id   INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    signal      TEXT NOT NULL,
    address_key TEXT NOT NULL,
    unit        TEXT,
    scale       REAL NOT NULL DEFAULT 1.0,
    enabled     INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (device_id, signal)
);
"#;

/// SQL statement for creating the measurements table (data table).
pub const MEASUREMENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS measurements (
    device_id INTEGER NOT NULL,
    signal    TEXT NOT NULL,
    value     REAL NOT NULL,
    quality   INTEGER NOT NULL,
    utc_ts    INTEGER NOT NULL,
    ingest_ts INTEGER NOT NULL
);
"#;

/// Index used by the retention sweep and time-range reads.
pub const MEASUREMENTS_TS_INDEX_DDL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_measurements_utc_ts ON measurements (utc_ts);
"#;

/// Initialize the database schema.
///
/// Creates all tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in [
        DEVICES_TABLE_DDL,
        TAG_MAPS_TABLE_DDL,
        MEASUREMENTS_TABLE_DDL,
        MEASUREMENTS_TS_INDEX_DDL,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}
