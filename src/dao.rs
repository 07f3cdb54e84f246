//! Persistence contract of the correlation engine.

use crate::error::StoreError;
use crate::model::{AlarmKey, CanonicalAlarm};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Tables whose populations are capped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Active alarm rows, including cleared ones not yet evicted
    Active,
    /// Clear-history log
    ClearLog,
}

/// Last allocated serial and sync numbers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NumberCounters {
    pub serial_no: i64,
    pub sync_no: i64,
}

impl NumberCounters {
    pub fn new(serial_no: i64, sync_no: i64) -> Self {
        Self { serial_no, sync_no }
    }

    /// Take the next serial and sync numbers
    pub fn allocate(&mut self) -> (i64, i64) {
        self.serial_no += 1;
        self.sync_no += 1;
        (self.serial_no, self.sync_no)
    }
}

/// Everything one correlation cycle writes, applied atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchTransaction {
    /// Rows to insert into, or replace in, the active table
    pub add_active: Vec<CanonicalAlarm>,
    /// New and updated alarms for the update history
    pub update_history: Vec<CanonicalAlarm>,
    /// Clear records for the clear log
    pub clear_history: Vec<CanonicalAlarm>,
    /// Sync numbers of persisted active rows superseded by `add_active`
    pub sync_nos: Vec<i64>,
    /// Counters after this batch's allocations
    pub counters: NumberCounters,
}

impl BatchTransaction {
    pub fn is_empty(&self) -> bool {
        self.add_active.is_empty()
            && self.update_history.is_empty()
            && self.clear_history.is_empty()
            && self.sync_nos.is_empty()
    }
}

/// Alarm persistence. Every call is synchronous and may fail with a
/// [`StoreError`].
pub trait AlarmStore: Send + Sync {
    /// Read the persisted serial/sync counters
    fn load_counters(&self) -> StoreResult<NumberCounters>;

    /// Active (not cleared) rows with this alarm identifier
    fn query_active_by_identifier(&self, alarm_id: &str) -> StoreResult<Vec<CanonicalAlarm>>;

    /// Active rows whose key equals `key` exactly
    fn query_active_by_key(&self, key: &AlarmKey) -> StoreResult<Vec<CanonicalAlarm>>;

    /// Apply one batch in a single transaction
    fn batch_store(&self, transaction: &BatchTransaction) -> StoreResult<()>;

    /// Delete up to `count` of the oldest cleared rows from the active table
    fn delete_cleared(&self, count: usize) -> StoreResult<usize>;

    /// Delete cleared rows from the active table cleared before `cutoff`
    fn purge_cleared_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    fn count_rows(&self, table: Table) -> StoreResult<usize>;
}

/// Moves the clear log to long-term storage once it outgrows its cap.
///
/// Called without waiting for the archive to finish.
pub trait HistoryArchiver: Send + Sync {
    fn request_archive(&self, history_rows: usize);
}

impl<F> HistoryArchiver for F
where
    F: Fn(usize) + Send + Sync,
{
    fn request_archive(&self, history_rows: usize) {
        self(history_rows)
    }
}

/// Archiver used when none is configured: it only reports the overflow
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyArchiver;

impl HistoryArchiver for LogOnlyArchiver {
    fn request_archive(&self, history_rows: usize) {
        warn!(history_rows, "clear log over capacity and no archiver configured");
    }
}
