//! Per-source sliding acknowledgment windows.
//!
//! Each reporting agent gets an [`AckWindow`]: a ring of `size` slots that
//! remembers which sequence numbers were accepted and which of those have been
//! confirmed as stored. The window lets an agent retry freely: a resend of an
//! in-flight sequence is suppressed, a resend of a finished one is re-acked,
//! and a restart or excessive skew degrades to a fresh window.

use crate::model::{SequenceNo, SourceKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sequence number an agent sends first after restarting
pub const RESET_SEQUENCE_NO: SequenceNo = 2;

/// Verdict for one inbound sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New sequence, forward it into the pipeline
    Accept,
    /// Already stored, ACK again without processing
    DropAndAck,
    /// Still in flight, drop without ACK
    DropSilent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    seq: SequenceNo,
    confirmed: bool,
}

/// Sliding window of sequence numbers for one source
#[derive(Debug)]
pub struct AckWindow {
    slots: Vec<Option<Slot>>,
    /// Slot index of the last contiguous confirmed sequence
    success_no: usize,
    /// Accepted entries ahead of `success_no`
    count: usize,
}

impl AckWindow {
    /// Create a window of `size` slots anchored just below `first_seq`
    ///
    /// # Panics
    ///
    /// Panics if size is smaller than 2.
    pub fn new(size: usize, first_seq: SequenceNo) -> Self {
        assert!(size >= 2, "window size must be at least 2");
        let mut window = Self {
            slots: vec![None; size],
            success_no: 0,
            count: 0,
        };
        window.reset(first_seq);
        window
    }

    /// Number of slots in the ring
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Accepted entries not yet folded into the frontier
    pub fn pending(&self) -> usize {
        self.count
    }

    /// Highest contiguous sequence considered resolved
    pub fn frontier(&self) -> SequenceNo {
        self.slots[self.success_no].map_or(0, |slot| slot.seq)
    }

    /// Reinitialize so that `seq` is the next sequence expected
    pub fn reset(&mut self, seq: SequenceNo) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.success_no = 0;
        self.slots[0] = Some(Slot {
            seq: seq.saturating_sub(1),
            confirmed: true,
        });
        self.count = 0;
    }

    /// Decide what to do with an inbound sequence number
    pub fn admit(&mut self, seq: SequenceNo) -> Admission {
        if seq == RESET_SEQUENCE_NO {
            warn!(sequence_no = seq, "source restarted, resetting window");
            self.reset(seq);
        }

        self.slide();

        let frontier = self.frontier();
        if seq <= frontier {
            debug!(sequence_no = seq, frontier, "sequence behind frontier");
            return Admission::DropAndAck;
        }

        let mut distance = self.distance(frontier, seq);
        if distance >= self.size() {
            warn!(
                sequence_no = seq,
                frontier,
                window_size = self.size(),
                "sequence outside window, resetting"
            );
            self.reset(seq);
            distance = 1;
        }

        let index = (self.success_no + distance) % self.size();
        match self.slots[index] {
            Some(slot) if slot.seq == seq && slot.confirmed => {
                debug!(sequence_no = seq, "resend of stored sequence");
                Admission::DropAndAck
            }
            Some(slot) if slot.seq == seq => {
                debug!(sequence_no = seq, "resend of in-flight sequence");
                Admission::DropSilent
            }
            _ => {
                self.slots[index] = Some(Slot {
                    seq,
                    confirmed: false,
                });
                self.count += 1;
                debug!(sequence_no = seq, pending = self.count, "sequence accepted");
                Admission::Accept
            }
        }
    }

    /// Mark an accepted sequence as stored.
    ///
    /// Returns false when the confirm is stale (behind the frontier, outside
    /// the window, or for a slot that now holds another sequence).
    pub fn confirm(&mut self, seq: SequenceNo) -> bool {
        let frontier = self.frontier();
        if seq <= frontier {
            debug!(sequence_no = seq, frontier, "confirm behind frontier");
            return false;
        }

        let distance = self.distance(frontier, seq);
        if distance >= self.size() {
            warn!(sequence_no = seq, frontier, "confirm outside window ignored");
            return false;
        }

        let index = (self.success_no + distance) % self.size();
        match self.slots[index].as_mut() {
            Some(slot) if slot.seq == seq => {
                slot.confirmed = true;
                true
            }
            _ => {
                warn!(sequence_no = seq, frontier, "confirm for unknown sequence ignored");
                false
            }
        }
    }

    fn distance(&self, frontier: SequenceNo, seq: SequenceNo) -> usize {
        // unrepresentable distances count as out of window
        seq.checked_sub(frontier)
            .and_then(|distance| usize::try_from(distance).ok())
            .unwrap_or(usize::MAX)
    }

    /// Advance the frontier over confirmed entries, and over gaps while
    /// later entries are pending.
    fn slide(&mut self) {
        let size = self.size();
        let base = self.frontier();
        let mut steps: SequenceNo = 0;

        for _ in 0..size {
            let next = (self.success_no + 1) % size;
            let advance = match self.slots[next] {
                Some(slot) if slot.confirmed => {
                    self.count = self.count.saturating_sub(1);
                    true
                }
                None => self.count > 0,
                Some(_) => false,
            };
            if !advance {
                break;
            }
            self.slots[self.success_no] = None;
            self.success_no = next;
            steps += 1;
        }

        if self.slots[self.success_no].is_none() {
            let seq = match self.slots[(self.success_no + 1) % size] {
                Some(slot) => slot.seq.saturating_sub(1),
                None => {
                    // lost track of pending entries; nothing ahead to wait for
                    self.count = 0;
                    base.saturating_add(steps)
                }
            };
            debug!(frontier = seq, "frontier landed on a gap");
            self.slots[self.success_no] = Some(Slot {
                seq,
                confirmed: true,
            });
        }
    }
}

/// One [`AckWindow`] per reporting source, created on first contact
#[derive(Debug)]
pub struct WindowRegistry {
    window_size: usize,
    windows: Mutex<HashMap<SourceKey, Arc<Mutex<AckWindow>>>>,
}

impl WindowRegistry {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Window for `key`, created anchored at `first_seq` if the source is new
    pub fn window(&self, key: &SourceKey, first_seq: SequenceNo) -> Arc<Mutex<AckWindow>> {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.get(key) {
            return Arc::clone(window);
        }
        debug!(source = %key, first_seq, "creating window");
        let window = Arc::new(Mutex::new(AckWindow::new(self.window_size, first_seq)));
        windows.insert(key.clone(), Arc::clone(&window));
        window
    }

    /// Admit one sequence for `key`, creating the window from that sequence
    pub fn admit(&self, key: &SourceKey, seq: SequenceNo) -> Admission {
        self.window(key, seq).lock().admit(seq)
    }

    /// Confirm a stored sequence. Unknown sources are ignored.
    pub fn confirm(&self, key: &SourceKey, seq: SequenceNo) -> bool {
        let window = self.windows.lock().get(key).cloned();
        match window {
            Some(window) => window.lock().confirm(seq),
            None => {
                debug!(source = %key, sequence_no = seq, "confirm for unknown source");
                false
            }
        }
    }

    /// Forget the window for `key`; the next report re-creates it
    pub fn reset(&self, key: &SourceKey) {
        if self.windows.lock().remove(key).is_some() {
            warn!(source = %key, "window reset");
        }
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.windows.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.lock().is_empty()
    }
}
