//! Holding area for alarms that several sources report for the same fault.
//!
//! Alarms whose identifier is configured for cross-source merge wait here,
//! grouped by alarm key, until their hold time passes. They are then released
//! together into normal correlation, which collapses the copies into one
//! active alarm. A group is forgotten once every member has been stored.

use crate::model::{AlarmKey, CanonicalAlarm, SequenceNo, SourceKey};
use crate::queue::BoundedQueue;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Alarms for one key: those still waiting out the hold time, and those
/// released to correlation but not yet stored
#[derive(Debug, Default)]
struct PendingGroup {
    held: Vec<CanonicalAlarm>,
    released: Vec<CanonicalAlarm>,
    /// Arrival of the oldest held alarm
    first_seen: Option<Instant>,
}

impl PendingGroup {
    fn is_empty(&self) -> bool {
        self.held.is_empty() && self.released.is_empty()
    }

    fn release(&mut self) {
        self.released.append(&mut self.held);
        self.first_seen = None;
    }
}

#[derive(Debug)]
pub struct DiverseSourceCache {
    merge_ids: HashSet<String>,
    hold: Duration,
    groups: Mutex<HashMap<AlarmKey, PendingGroup>>,
}

impl DiverseSourceCache {
    pub fn new<I, S>(merge_ids: I, hold: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            merge_ids: merge_ids.into_iter().map(Into::into).collect(),
            hold,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Whether alarms with this identifier are held for merge
    pub fn requires_merge(&self, alarm_id: &str) -> bool {
        self.merge_ids.contains(alarm_id)
    }

    pub fn put(&self, alarm: CanonicalAlarm) {
        self.put_at(alarm, Instant::now());
    }

    /// Hold `alarm`. A late member of a group already released starts a new
    /// hold period of its own.
    fn put_at(&self, alarm: CanonicalAlarm, now: Instant) {
        debug!(alarm_id = %alarm.alarm_id, source = %alarm.source, "holding alarm for merge");
        let mut groups = self.groups.lock();
        let group = groups.entry(alarm.key()).or_default();
        group.first_seen.get_or_insert(now);
        group.held.push(alarm);
    }

    /// Release every group held for at least the hold time into `out`.
    ///
    /// A group that does not fit stays held for the next sweep. Returns the
    /// number of alarms released.
    pub fn sweep(&self, out: &BoundedQueue<CanonicalAlarm>) -> usize {
        self.sweep_at(Instant::now(), out)
    }

    fn sweep_at(&self, now: Instant, out: &BoundedQueue<CanonicalAlarm>) -> usize {
        let mut groups = self.groups.lock();
        let mut due: Vec<(&AlarmKey, &mut PendingGroup, Instant)> = groups
            .iter_mut()
            .filter_map(|(key, group)| {
                let since = group.first_seen?;
                (now.duration_since(since) >= self.hold).then_some((key, group, since))
            })
            .collect();
        due.sort_by_key(|(_, _, since)| *since);

        let mut released = 0;
        for (key, group, _) in due {
            let count = group.held.len();
            if out.offer_all(group.held.clone()).is_err() {
                warn!(alarm_id = %key.alarm_id, count, "store queue full, merge group held");
                break;
            }
            group.release();
            released += count;
        }
        released
    }

    /// Take every alarm not yet released, marking it released
    pub fn drain_held(&self) -> Vec<CanonicalAlarm> {
        let mut groups = self.groups.lock();
        groups
            .values_mut()
            .flat_map(|group| {
                let held = group.held.clone();
                group.release();
                held
            })
            .collect()
    }

    /// Forget stored alarms, identified by source and sequence number
    pub fn remove_finalized(&self, stored: &[CanonicalAlarm]) {
        if stored.is_empty() {
            return;
        }
        let done: HashSet<(&SourceKey, SequenceNo)> = stored
            .iter()
            .filter(|alarm| self.requires_merge(&alarm.alarm_id))
            .map(|alarm| (&alarm.source, alarm.sequence_no))
            .collect();
        if done.is_empty() {
            return;
        }

        let mut groups = self.groups.lock();
        let unfinished = |alarm: &CanonicalAlarm| !done.contains(&(&alarm.source, alarm.sequence_no));
        for group in groups.values_mut() {
            group.released.retain(unfinished);
            group.held.retain(unfinished);
            if group.held.is_empty() {
                group.first_seen = None;
            }
        }
        groups.retain(|_, group| !group.is_empty());
    }

    /// Alarms held or released but not yet stored
    pub fn pending_len(&self) -> usize {
        self.groups
            .lock()
            .values()
            .map(|group| group.held.len() + group.released.len())
            .sum()
    }

    /// Alarms waiting for their hold time
    pub fn held_len(&self) -> usize {
        self.groups.lock().values().map(|group| group.held.len()).sum()
    }
}
