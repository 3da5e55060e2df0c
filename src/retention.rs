//! Retention sweep.
//!
//! Once a day at `cleanup_hour` local time, rows older than `retention_days`
//! are deleted in small batches with a pause between them so live writers are
//! not starved. The cutoff is computed once at the start of a sweep.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::storage::{RetentionStore, StorageError};

/// Completed sweeps kept for the API.
pub const HISTORY_LIMIT: usize = 30;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Local hour (0-23) of the daily sweep.
    #[serde(default = "default_cleanup_hour")]
    pub cleanup_hour: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    #[serde(default = "default_batch_pause", with = "humantime_serde")]
    pub batch_pause: Duration,

    /// Bound on each count or delete statement.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

fn default_enabled() -> bool {
    true
}

fn default_retention_days() -> u32 {
    10
}

fn default_cleanup_hour() -> u32 {
    2
}

fn default_batch_size() -> u64 {
    10_000
}

fn default_batch_pause() -> Duration {
    Duration::from_millis(100)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            retention_days: default_retention_days(),
            cleanup_hour: default_cleanup_hour(),
            batch_size: default_batch_size(),
            batch_pause: default_batch_pause(),
            command_timeout: default_command_timeout(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupStats {
    pub deleted_count: u64,
    pub retained_count: u64,
    pub cleanup_date: DateTime<Utc>,
    pub cutoff_date: DateTime<Utc>,
    pub batches: u32,
    /// False when shutdown interrupted the sweep between batches.
    pub completed: bool,
}

/// Row counts around the current cutoff, without deleting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionStats {
    pub enabled: bool,
    pub retention_days: u32,
    pub cutoff_date: DateTime<Utc>,
    pub expired_rows: u64,
    pub retained_rows: u64,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<CleanupStats>,
}

/// Next occurrence of `hour:00` strictly after `now` in `now`'s timezone.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Tz> {
    let tz = now.timezone();
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let mut day = now.date_naive();
    loop {
        // A DST gap can skip the hour entirely; fall through to the next day.
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest()
            && candidate > *now
        {
            return candidate;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => return now.clone(),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Scheduled batched deletion of expired measurements.
pub struct RetentionManager {
    store: Arc<dyn RetentionStore>,
    config: RetentionConfig,
    shutdown: Option<watch::Receiver<bool>>,
    history: Mutex<VecDeque<CleanupStats>>,
    sweep_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetentionManager {
    pub fn new(store: Arc<dyn RetentionStore>, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            shutdown: None,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Stop sweeps between batches once this flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    fn history_lock(&self) -> MutexGuard<'_, VecDeque<CleanupStats>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.config.retention_days))
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.config.command_timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout(self.config.command_timeout))?
    }

    /// Start the daily schedule. Returns `None` when retention is disabled.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("Retention disabled");
            return None;
        }
        Some(tokio::spawn(async move { self.run(shutdown).await }))
    }

    /// Sleep until each `cleanup_hour` and sweep, until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            retention_days = self.config.retention_days,
            cleanup_hour = self.config.cleanup_hour,
            "Retention scheduler started"
        );

        loop {
            let now = Local::now();
            let next = next_run_after(&now, self.config.cleanup_hour);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(next_run = %next, "Next retention sweep scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.run_cleanup_once().await {
                tracing::error!(error = %e, "Retention sweep failed");
            }
        }

        tracing::info!("Retention scheduler stopped");
    }

    /// Perform one sweep now.
    pub async fn run_cleanup_once(&self) -> Result<CleanupStats, StorageError> {
        let _guard = self.sweep_lock.lock().await;
        let started = Utc::now();
        let cutoff = self.cutoff(started);

        let expired = self.bounded(self.store.count_older_than(cutoff)).await?;
        let retained = self.bounded(self.store.count_at_or_after(cutoff)).await?;

        let mut stats = CleanupStats {
            deleted_count: 0,
            retained_count: retained,
            cleanup_date: started,
            cutoff_date: cutoff,
            batches: 0,
            completed: true,
        };

        if expired > 0 {
            tracing::info!(expired, retained, cutoff = %cutoff, "Retention sweep started");
        }

        let batch_size = self.config.batch_size.max(1);
        while stats.deleted_count < expired {
            if self.shutting_down() {
                stats.completed = false;
                tracing::info!(deleted = stats.deleted_count, "Retention sweep interrupted by shutdown");
                break;
            }

            let deleted = self
                .bounded(self.store.delete_older_than(cutoff, batch_size))
                .await?;
            stats.batches += 1;
            stats.deleted_count += deleted;
            tracing::debug!(batch = stats.batches, deleted, total = stats.deleted_count, "Retention batch deleted");

            if deleted == 0 || stats.deleted_count >= expired {
                break;
            }
            tokio::time::sleep(self.config.batch_pause).await;
        }

        tracing::info!(
            deleted = stats.deleted_count,
            retained = stats.retained_count,
            batches = stats.batches,
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "Retention sweep finished"
        );

        let mut history = self.history_lock();
        if history.len() >= HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(stats.clone());
        Ok(stats)
    }

    /// Past sweeps, most recent first.
    pub fn history(&self) -> Vec<CleanupStats> {
        self.history_lock().iter().rev().cloned().collect()
    }

    pub async fn retention_stats(&self) -> Result<RetentionStats, StorageError> {
        let cutoff = self.cutoff(Utc::now());
        let expired_rows = self.bounded(self.store.count_older_than(cutoff)).await?;
        let retained_rows = self.bounded(self.store.count_at_or_after(cutoff)).await?;
        let next_run = self
            .config
            .enabled
            .then(|| next_run_after(&Local::now(), self.config.cleanup_hour).with_timezone(&Utc));

        Ok(RetentionStats {
            enabled: self.config.enabled,
            retention_days: self.config.retention_days,
            cutoff_date: cutoff,
            expired_rows,
            retained_rows,
            next_run,
            last_run: self.history_lock().back().cloned(),
        })
    }
}
