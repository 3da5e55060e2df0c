//! Database backend.
//!
//! - `SqlitePool`: Connection pool wrapper for SQLite
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:data/meterwatch.db?mode=rwc").await?;
//! let row = sqlx::query("SELECT 1").fetch_one(pool.inner()).await?;
//! ```

mod sqlite;

pub use sqlite::SqlitePool;
