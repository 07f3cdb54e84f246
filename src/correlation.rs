//! The correlation engine.
//!
//! Each cycle drains the pretreated queue into the batch queue and decides,
//! per alarm, whether it raises a new active alarm, repeats or updates one
//! already known (in this batch or in the store), or clears one. The
//! decisions are staged in a [`BatchTransaction`] and applied in one store
//! call. Only after that call succeeds is the batch queue emptied and every
//! alarm in it acknowledged, so a failed cycle retries the same batch.
//! Acknowledgments that do not fit the ACK queue are kept and offered again
//! on the next cycle.
//!
//! Batch cycles, manual clears and purges are serialized by one lock.

use crate::dao::{AlarmStore, BatchTransaction, HistoryArchiver, Table};
use crate::diverse::DiverseSourceCache;
use crate::error::{FaultError, Result};
use crate::matching::{find_match, is_match, match_mode, MatchMode};
use crate::model::{AckRecord, AlarmCategory, AlarmKey, CanonicalAlarm};
use crate::queue::BoundedQueue;
use crate::reference::ReferenceData;
use crate::stage::{Stage, StepOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tunables of the correlation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationSettings {
    /// With update support, a changed additional info makes a repeat an update
    pub update_support: bool,
    /// Capacity of the batch queue, the most alarms one transaction carries
    pub batch_capacity: usize,
    pub max_active_rows: usize,
    pub max_history_rows: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            update_support: true,
            batch_capacity: 500,
            max_active_rows: 10_000,
            max_history_rows: 100_000,
        }
    }
}

/// Queues the engine reads from and writes to
#[derive(Clone)]
pub struct CorrelationQueues {
    pub to_store: Arc<BoundedQueue<CanonicalAlarm>>,
    pub report: Arc<BoundedQueue<CanonicalAlarm>>,
    pub acks: Arc<BoundedQueue<AckRecord>>,
}

pub struct CorrelationEngine {
    settings: CorrelationSettings,
    store: Arc<dyn AlarmStore>,
    reference: Arc<dyn ReferenceData>,
    diverse: Arc<DiverseSourceCache>,
    archiver: Arc<dyn HistoryArchiver>,
    to_store: Arc<BoundedQueue<CanonicalAlarm>>,
    batch: BoundedQueue<CanonicalAlarm>,
    report: Arc<BoundedQueue<CanonicalAlarm>>,
    acks: Arc<BoundedQueue<AckRecord>>,
    held_acks: Mutex<VecDeque<AckRecord>>,
    history_rows: AtomicUsize,
    archive_requested: AtomicBool,
    cycle_lock: Mutex<()>,
}

impl CorrelationEngine {
    /// Build the engine, reading the clear-log row count from the store.
    ///
    /// A store that cannot be counted is a startup failure.
    pub fn new(
        settings: CorrelationSettings,
        queues: CorrelationQueues,
        store: Arc<dyn AlarmStore>,
        reference: Arc<dyn ReferenceData>,
        diverse: Arc<DiverseSourceCache>,
        archiver: Arc<dyn HistoryArchiver>,
    ) -> Result<Self> {
        if settings.batch_capacity == 0 {
            return Err(FaultError::Config("batch queue capacity must be positive".into()));
        }
        let history_rows = store
            .count_rows(Table::ClearLog)
            .map_err(|e| FaultError::Startup(format!("cannot count clear log: {e}")))?;
        info!(history_rows, update_support = settings.update_support, "correlation engine ready");

        Ok(Self {
            settings,
            store,
            reference,
            diverse,
            archiver,
            to_store: queues.to_store,
            batch: BoundedQueue::new(settings.batch_capacity),
            report: queues.report,
            acks: queues.acks,
            held_acks: Mutex::new(VecDeque::new()),
            history_rows: AtomicUsize::new(history_rows),
            archive_requested: AtomicBool::new(false),
            cycle_lock: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &CorrelationSettings {
        &self.settings
    }

    /// Alarms waiting in the batch queue, including a batch that failed to store
    pub fn pending_batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Acknowledgments of stored alarms waiting for room in the ACK queue
    pub fn held_acks_len(&self) -> usize {
        self.held_acks.lock().len()
    }

    /// Clear-log rows written since startup, plus those present at startup,
    /// less those reported archived
    pub fn history_rows(&self) -> usize {
        self.history_rows.load(Ordering::SeqCst)
    }

    /// Run one batch cycle.
    ///
    /// A store failure is logged and answered with [`StepOutcome::Retry`];
    /// the batch stays queued for the next cycle.
    pub fn run_cycle(&self) -> Result<StepOutcome> {
        let _guard = self.cycle_lock.lock();
        self.send_acks(std::iter::empty());
        let moved = self.to_store.drain_into(&self.batch, self.batch.capacity());
        if self.batch.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let alarms = self.batch.snapshot();
        debug!(moved, batch = alarms.len(), "correlating batch");
        let transaction = match self.store_batch(&alarms) {
            Ok(transaction) => transaction,
            Err(e) => {
                error!(batch = alarms.len(), error = %e, "batch not stored, retrying next cycle");
                return Ok(StepOutcome::Retry);
            }
        };

        self.batch.clear();
        self.finish(&alarms, &transaction);
        Ok(StepOutcome::Processed(alarms.len()))
    }

    /// Correlate and store `alarms` right away, bypassing the queues.
    ///
    /// Used to flush held alarms at shutdown.
    pub fn store_now(&self, alarms: Vec<CanonicalAlarm>) -> Result<usize> {
        if alarms.is_empty() {
            return Ok(0);
        }
        let _guard = self.cycle_lock.lock();
        let transaction = self.store_batch(&alarms)?;
        self.finish(&alarms, &transaction);
        Ok(alarms.len())
    }

    /// Clear every active alarm whose key equals `key`, as of `at`
    pub fn manual_clear(&self, key: &AlarmKey, at: DateTime<Utc>) -> Result<usize> {
        let _guard = self.cycle_lock.lock();
        let rows = self.store.query_active_by_key(key)?;
        if rows.is_empty() {
            info!(alarm_id = %key.alarm_id, location = %key.location_info, "no active alarm to clear");
            return Ok(0);
        }

        let mut transaction = BatchTransaction {
            counters: self.store.load_counters()?,
            ..Default::default()
        };
        for row in &rows {
            let cleared = row.cleared_at(at);
            transaction.sync_nos.push(row.sync_no);
            transaction.clear_history.push(CanonicalAlarm {
                category: AlarmCategory::Clear,
                ..cleared.clone()
            });
            transaction.add_active.push(cleared);
        }
        self.store.batch_store(&transaction)?;
        self.history_rows
            .fetch_add(transaction.clear_history.len(), Ordering::SeqCst);

        info!(alarm_id = %key.alarm_id, cleared = rows.len(), "alarms cleared manually");
        self.report_results(&transaction);
        self.enforce_caps();
        Ok(rows.len())
    }

    /// Delete cleared alarms whose clear time is older than `retention`
    pub fn purge_cleared(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| FaultError::Config(format!("retention out of range: {e}")))?;
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };

        let _guard = self.cycle_lock.lock();
        let purged = self.store.purge_cleared_before(cutoff)?;
        if purged > 0 {
            info!(purged, %cutoff, "cleared alarms purged");
        }
        Ok(purged)
    }

    /// Record that the archiver moved `rows` clear-log rows away
    pub fn history_archived(&self, rows: usize) {
        let previous = self
            .history_rows
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(rows))
            })
            .unwrap_or_else(|current| current);
        info!(archived = rows, remaining = previous.saturating_sub(rows), "clear log archived");
        self.archive_requested.store(false, Ordering::SeqCst);
    }

    /// Dispatch every alarm and apply the resulting transaction
    fn store_batch(&self, alarms: &[CanonicalAlarm]) -> Result<BatchTransaction> {
        let mut transaction = BatchTransaction {
            counters: self.store.load_counters()?,
            ..Default::default()
        };

        for alarm in alarms {
            match alarm.category {
                AlarmCategory::Alarm => self.dispatch_alarm(alarm, &mut transaction)?,
                AlarmCategory::Clear => self.dispatch_clear(alarm, &mut transaction)?,
                AlarmCategory::Event => {
                    debug!(alarm_id = %alarm.alarm_id, sequence_no = alarm.sequence_no, "event not correlated");
                }
            }
        }

        self.store.batch_store(&transaction)?;
        self.history_rows
            .fetch_add(transaction.clear_history.len(), Ordering::SeqCst);
        self.diverse.remove_finalized(alarms);
        debug!(
            active = transaction.add_active.len(),
            updates = transaction.update_history.len(),
            clears = transaction.clear_history.len(),
            "batch stored"
        );
        Ok(transaction)
    }

    fn dispatch_alarm(&self, incoming: &CanonicalAlarm, transaction: &mut BatchTransaction) -> Result<()> {
        let masked = self
            .reference
            .definition(&incoming.alarm_id)
            .is_some_and(|definition| definition.display_masked);
        let incoming = incoming.clone().with_display_suppressed(masked);
        let update_support = self.settings.update_support;

        if let Some(cached) = transaction
            .add_active
            .iter_mut()
            .find(|row| row.matches_active(&incoming))
        {
            if cached.is_duplicate_of(&incoming, update_support) {
                debug!(alarm_id = %incoming.alarm_id, sequence_no = incoming.sequence_no, "duplicate of batch alarm");
                return Ok(());
            }
            if update_support {
                *cached = cached.updated_with(&incoming);
                transaction.update_history.push(cached.clone());
                return Ok(());
            }
            raise(incoming, transaction);
            return Ok(());
        }

        let persisted = match self.find_persisted(&incoming)? {
            Some(persisted) if !cleared_in_batch(transaction, &persisted) => persisted,
            _ => {
                raise(incoming, transaction);
                return Ok(());
            }
        };

        // an earlier alarm in this batch may already have replaced the stored row
        let staged = transaction
            .add_active
            .iter()
            .position(|row| row.sync_no == persisted.sync_no);
        let current = staged.map_or(&persisted, |i| &transaction.add_active[i]);
        if current.is_duplicate_of(&incoming, update_support) {
            debug!(alarm_id = %incoming.alarm_id, sequence_no = incoming.sequence_no, "duplicate of stored alarm");
            return Ok(());
        }
        if !update_support {
            raise(incoming, transaction);
            return Ok(());
        }

        let updated = incoming.with_numbers(persisted.serial_no, persisted.sync_no);
        debug!(alarm_id = %updated.alarm_id, sync_no = updated.sync_no, severity = updated.severity, "stored alarm updated");
        match staged {
            Some(i) => transaction.add_active[i] = updated.clone(),
            None => {
                transaction.sync_nos.push(persisted.sync_no);
                transaction.add_active.push(updated.clone());
            }
        }
        transaction.update_history.push(updated);
        Ok(())
    }

    fn dispatch_clear(&self, clear: &CanonicalAlarm, transaction: &mut BatchTransaction) -> Result<()> {
        let schema = self.reference.location_schema(&clear.alarm_id);
        let mode = match_mode(&clear.location_info, schema.as_deref());

        if let Some(target) = transaction
            .add_active
            .iter_mut()
            .find(|row| row.is_active() && is_match(clear, row, &mode))
        {
            let record = clear.clear_record_for(target);
            *target = target.cleared_at(clear.occur_time);
            transaction.clear_history.push(record);
            return Ok(());
        }

        let candidates = self.store.query_active_by_identifier(&clear.alarm_id)?;
        let Some(target) = find_match(clear, &candidates, &mode).and_then(|i| candidates.get(i)) else {
            info!(alarm_id = %clear.alarm_id, location = %clear.location_info, source = %clear.source, "no active alarm for clear, dropped");
            return Ok(());
        };
        if cleared_in_batch(transaction, target) {
            debug!(alarm_id = %clear.alarm_id, sync_no = target.sync_no, "alarm already cleared in batch");
            return Ok(());
        }

        transaction.sync_nos.push(target.sync_no);
        transaction.add_active.push(target.cleared_at(clear.occur_time));
        transaction.clear_history.push(clear.clear_record_for(target));
        Ok(())
    }

    /// First active stored alarm matching `incoming`
    fn find_persisted(&self, incoming: &CanonicalAlarm) -> Result<Option<CanonicalAlarm>> {
        let schema = self.reference.location_schema(&incoming.alarm_id);
        let mode = match_mode(&incoming.location_info, schema.as_deref());
        if mode == MatchMode::WholeField {
            return Ok(self
                .store
                .query_active_by_key(&incoming.key())?
                .into_iter()
                .next());
        }

        let candidates: Vec<CanonicalAlarm> = self
            .store
            .query_active_by_identifier(&incoming.alarm_id)?
            .into_iter()
            .filter(|row| {
                row.managed_object == incoming.managed_object && row.resource_id == incoming.resource_id
            })
            .collect();
        let found = find_match(incoming, &candidates, &mode);
        Ok(found.and_then(|i| candidates.into_iter().nth(i)))
    }

    /// Acknowledge, report and enforce caps after a stored batch
    fn finish(&self, alarms: &[CanonicalAlarm], transaction: &BatchTransaction) {
        self.send_acks(alarms.iter().map(CanonicalAlarm::ack));
        self.report_results(transaction);
        self.enforce_caps();
    }

    /// Offer held acknowledgments, then `fresh` ones, keeping what does not fit
    fn send_acks(&self, fresh: impl Iterator<Item = AckRecord>) {
        let mut held = self.held_acks.lock();
        held.extend(fresh);
        while let Some(ack) = held.pop_front() {
            if let Err(ack) = self.acks.offer(ack) {
                held.push_front(ack);
                warn!(held = held.len(), "ack queue full, acks held for next cycle");
                break;
            }
        }
    }

    fn report_results(&self, transaction: &BatchTransaction) {
        let reportable = transaction
            .update_history
            .iter()
            .chain(&transaction.clear_history)
            .filter(|alarm| !alarm.display_suppressed);
        for alarm in reportable {
            if self.report.offer(alarm.clone()).is_err() {
                warn!(alarm_id = %alarm.alarm_id, sync_no = alarm.sync_no, "report queue full, results not reported");
                break;
            }
        }
    }

    fn enforce_caps(&self) {
        match self.store.count_rows(Table::Active) {
            Ok(active) if active > self.settings.max_active_rows => {
                let excess = active - self.settings.max_active_rows;
                match self.store.delete_cleared(excess) {
                    Ok(deleted) => info!(active, deleted, "active table over capacity, cleared rows deleted"),
                    Err(e) => warn!(active, error = %e, "could not delete cleared rows"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not count active rows"),
        }

        let history_rows = self.history_rows();
        if history_rows >= self.settings.max_history_rows
            && !self.archive_requested.swap(true, Ordering::SeqCst)
        {
            info!(history_rows, "clear log over capacity, requesting archive");
            self.archiver.request_archive(history_rows);
        }
    }
}

/// Stage `incoming` as a new active alarm with freshly allocated numbers
fn raise(incoming: CanonicalAlarm, transaction: &mut BatchTransaction) {
    let (serial_no, sync_no) = transaction.counters.allocate();
    let raised = incoming.with_numbers(serial_no, sync_no);
    debug!(alarm_id = %raised.alarm_id, serial_no, sync_no, "new active alarm");
    transaction.add_active.push(raised.clone());
    transaction.update_history.push(raised);
}

/// `persisted` already has a cleared copy staged in this transaction
fn cleared_in_batch(transaction: &BatchTransaction, persisted: &CanonicalAlarm) -> bool {
    transaction
        .add_active
        .iter()
        .any(|row| !row.is_active() && row.sync_no == persisted.sync_no)
}

/// Runs the engine's batch cycle on a pipeline worker
pub struct CorrelationStage {
    engine: Arc<CorrelationEngine>,
}

impl CorrelationStage {
    pub fn new(engine: Arc<CorrelationEngine>) -> Self {
        Self { engine }
    }
}

impl Stage for CorrelationStage {
    fn step(&mut self) -> Result<StepOutcome> {
        self.engine.run_cycle()
    }

    fn name(&self) -> &str {
        "store"
    }
}
