//! In-process [`AlarmStore`] for tests, benches and embedding without a
//! database.

use crate::dao::{AlarmStore, BatchTransaction, NumberCounters, StoreResult, Table};
use crate::error::StoreError;
use crate::model::{AlarmKey, CanonicalAlarm};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Tables {
    active: Vec<CanonicalAlarm>,
    update_log: Vec<CanonicalAlarm>,
    clear_log: Vec<CanonicalAlarm>,
    counters: NumberCounters,
}

/// Alarm tables held in memory behind one lock.
///
/// Failures can be injected to exercise the retry paths of the pipeline.
#[derive(Debug, Default)]
pub struct MemoryAlarmStore {
    tables: Mutex<Tables>,
    failing_batches: AtomicUsize,
    counters_down: AtomicBool,
    queries_down: AtomicBool,
    batches_applied: AtomicUsize,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counters(counters: NumberCounters) -> Self {
        let store = Self::new();
        store.tables.lock().counters = counters;
        store
    }

    /// Insert a row into the active table directly
    pub fn seed_active(&self, alarm: CanonicalAlarm) {
        self.tables.lock().active.push(alarm);
    }

    /// Append a row to the clear log directly
    pub fn seed_clear_log(&self, alarm: CanonicalAlarm) {
        self.tables.lock().clear_log.push(alarm);
    }

    /// Make the next `count` batch transactions fail
    pub fn fail_next_batches(&self, count: usize) {
        self.failing_batches.store(count, Ordering::SeqCst);
    }

    pub fn set_counters_available(&self, available: bool) {
        self.counters_down.store(!available, Ordering::SeqCst);
    }

    pub fn set_queries_available(&self, available: bool) {
        self.queries_down.store(!available, Ordering::SeqCst);
    }

    pub fn active_rows(&self) -> Vec<CanonicalAlarm> {
        self.tables.lock().active.clone()
    }

    pub fn update_log(&self) -> Vec<CanonicalAlarm> {
        self.tables.lock().update_log.clone()
    }

    pub fn clear_log(&self) -> Vec<CanonicalAlarm> {
        self.tables.lock().clear_log.clone()
    }

    pub fn counters(&self) -> NumberCounters {
        self.tables.lock().counters
    }

    /// Successful batch transactions so far
    pub fn batches_applied(&self) -> usize {
        self.batches_applied.load(Ordering::SeqCst)
    }

    /// Remove and return the clear log, as an archive job would
    pub fn take_clear_log(&self) -> Vec<CanonicalAlarm> {
        std::mem::take(&mut self.tables.lock().clear_log)
    }

    fn check_queries(&self) -> StoreResult<()> {
        if self.queries_down.load(Ordering::SeqCst) {
            return Err(StoreError::Query("active table unavailable".into()));
        }
        Ok(())
    }
}

impl AlarmStore for MemoryAlarmStore {
    fn load_counters(&self) -> StoreResult<NumberCounters> {
        if self.counters_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("counter table unavailable".into()));
        }
        Ok(self.tables.lock().counters)
    }

    fn query_active_by_identifier(&self, alarm_id: &str) -> StoreResult<Vec<CanonicalAlarm>> {
        self.check_queries()?;
        Ok(self
            .tables
            .lock()
            .active
            .iter()
            .filter(|row| row.is_active() && row.alarm_id == alarm_id)
            .cloned()
            .collect())
    }

    fn query_active_by_key(&self, key: &AlarmKey) -> StoreResult<Vec<CanonicalAlarm>> {
        self.check_queries()?;
        Ok(self
            .tables
            .lock()
            .active
            .iter()
            .filter(|row| row.is_active() && row.has_key(key))
            .cloned()
            .collect())
    }

    fn batch_store(&self, transaction: &BatchTransaction) -> StoreResult<()> {
        let failing = self.failing_batches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_batches.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Transaction("injected rollback".into()));
        }

        let mut tables = self.tables.lock();
        let superseded: HashSet<i64> = transaction.sync_nos.iter().copied().collect();
        tables.active.retain(|row| !superseded.contains(&row.sync_no));
        for alarm in &transaction.add_active {
            match tables.active.iter_mut().find(|row| row.sync_no == alarm.sync_no) {
                Some(row) => *row = alarm.clone(),
                None => tables.active.push(alarm.clone()),
            }
        }
        tables
            .update_log
            .extend(transaction.update_history.iter().cloned());
        tables
            .clear_log
            .extend(transaction.clear_history.iter().cloned());
        tables.counters = transaction.counters;
        self.batches_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_cleared(&self, count: usize) -> StoreResult<usize> {
        let mut tables = self.tables.lock();
        let mut cleared: Vec<(Option<DateTime<Utc>>, i64)> = tables
            .active
            .iter()
            .filter(|row| !row.is_active())
            .map(|row| (row.clear_time, row.sync_no))
            .collect();
        cleared.sort();
        let doomed: HashSet<i64> = cleared.into_iter().take(count).map(|(_, sync)| sync).collect();
        let before = tables.active.len();
        tables
            .active
            .retain(|row| row.is_active() || !doomed.contains(&row.sync_no));
        Ok(before - tables.active.len())
    }

    fn purge_cleared_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut tables = self.tables.lock();
        let before = tables.active.len();
        tables
            .active
            .retain(|row| row.is_active() || row.clear_time.is_some_and(|at| at >= cutoff));
        Ok(before - tables.active.len())
    }

    fn count_rows(&self, table: Table) -> StoreResult<usize> {
        self.check_queries()?;
        let tables = self.tables.lock();
        Ok(match table {
            Table::Active => tables.active.len(),
            Table::ClearLog => tables.clear_log.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{alarm, occur};

    #[test]
    fn test_batch_replaces_superseded_rows() {
        let store = MemoryAlarmStore::new();
        store.seed_active(alarm("100", "A,B", 3, 1).with_numbers(1, 1));
        store.seed_active(alarm("200", "C", 3, 2).with_numbers(2, 2));

        let transaction = BatchTransaction {
            add_active: vec![
                alarm("100", "A,B", 5, 3).with_numbers(1, 1),
                alarm("300", "D", 2, 4).with_numbers(3, 3),
            ],
            update_history: vec![alarm("300", "D", 2, 4).with_numbers(3, 3)],
            clear_history: vec![],
            sync_nos: vec![1],
            counters: NumberCounters::new(3, 3),
        };
        store.batch_store(&transaction).unwrap();

        let active = store.active_rows();
        assert_eq!(active.len(), 3);
        assert!(active.iter().any(|row| row.alarm_id == "100" && row.severity == 5));
        assert_eq!(store.update_log().len(), 1);
        assert_eq!(store.load_counters().unwrap(), NumberCounters::new(3, 3));
    }

    #[test]
    fn test_injected_batch_failure_leaves_tables() {
        let store = MemoryAlarmStore::new();
        store.fail_next_batches(1);
        let transaction = BatchTransaction {
            add_active: vec![alarm("100", "A", 3, 1).with_numbers(1, 1)],
            ..Default::default()
        };
        assert!(matches!(
            store.batch_store(&transaction),
            Err(StoreError::Transaction(_))
        ));
        assert!(store.active_rows().is_empty());
        store.batch_store(&transaction).unwrap();
        assert_eq!(store.active_rows().len(), 1);
        assert_eq!(store.batches_applied(), 1);
    }

    #[test]
    fn test_queries_skip_cleared_rows() {
        let store = MemoryAlarmStore::new();
        let raised = alarm("100", "A,B", 3, 1).with_numbers(1, 1);
        store.seed_active(raised.cleared_at(occur(5)));
        store.seed_active(alarm("100", "A,C", 3, 2).with_numbers(2, 2));

        let by_id = store.query_active_by_identifier("100").unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].location_info, "A,C");
        assert!(store.query_active_by_key(&raised.key()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_oldest_cleared() {
        let store = MemoryAlarmStore::new();
        for seq in 1..=4 {
            let row = alarm("100", &format!("L{seq}"), 3, seq).with_numbers(seq, seq);
            store.seed_active(row.cleared_at(occur(100 - seq)));
        }
        store.seed_active(alarm("100", "live", 3, 9).with_numbers(9, 9));

        assert_eq!(store.delete_cleared(2).unwrap(), 2);
        let remaining: Vec<i64> = store.active_rows().iter().map(|row| row.sync_no).collect();
        assert_eq!(remaining, vec![1, 2, 9]);
    }

    #[test]
    fn test_purge_cleared_before_cutoff() {
        let store = MemoryAlarmStore::new();
        store.seed_active(alarm("100", "old", 3, 1).with_numbers(1, 1).cleared_at(occur(10)));
        store.seed_active(alarm("100", "new", 3, 2).with_numbers(2, 2).cleared_at(occur(50)));
        assert_eq!(store.purge_cleared_before(occur(20)).unwrap(), 1);
        assert_eq!(store.count_rows(Table::Active).unwrap(), 1);
    }

    #[test]
    fn test_unavailable_counters() {
        let store = MemoryAlarmStore::new();
        store.set_counters_available(false);
        assert!(matches!(store.load_counters(), Err(StoreError::Unavailable(_))));
    }
}
