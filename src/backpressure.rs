use crate::queue::BoundedQueue;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Watermark gauge over a queue's utilization.
///
/// Pressure starts when utilization reaches the high watermark and ends once
/// it falls to the low watermark, so a queue hovering near one threshold does
/// not flap.
#[derive(Debug)]
pub struct PressureGauge {
    name: &'static str,
    /// High watermark: threshold at which pressure is reported (percentage)
    high_watermark: u32,
    /// Low watermark: threshold at which pressure is released (percentage)
    low_watermark: u32,
    is_active: AtomicBool,
}

impl PressureGauge {
    /// Create a gauge with high=80%, low=40%
    pub fn new(name: &'static str) -> Self {
        Self::with_watermarks(name, 80, 40)
    }

    /// Set custom watermark thresholds
    pub fn with_watermarks(name: &'static str, high: u32, low: u32) -> Self {
        let high = high.min(100);
        Self {
            name,
            high_watermark: high,
            low_watermark: low.min(high),
            is_active: AtomicBool::new(false),
        }
    }

    /// Sample the queue and update pressure state.
    ///
    /// Returns true while pressure is active.
    pub fn check_and_update<T>(&self, queue: &BoundedQueue<T>) -> bool {
        self.observe(queue.utilization())
    }

    /// Update pressure state from a utilization percentage
    pub fn observe(&self, utilization: u32) -> bool {
        let was_active = self.is_active.load(Ordering::Relaxed);

        let is_now_active = if was_active {
            utilization > self.low_watermark
        } else {
            utilization >= self.high_watermark
        };

        if is_now_active != was_active {
            self.is_active.store(is_now_active, Ordering::Relaxed);
            if is_now_active {
                warn!(queue = self.name, utilization, "queue pressure started");
            } else {
                info!(queue = self.name, utilization, "queue pressure released");
            }
        }

        is_now_active
    }

    /// Get whether pressure is currently active
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.is_active.store(false, Ordering::Relaxed);
    }
}

/// How long a stage waits after an idle or failed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    /// Pause when the input is empty or the output is full
    pub idle: Duration,
    /// Pause after a failed cycle before retrying the same work
    pub failure_backoff: Duration,
}

impl StageTiming {
    pub fn new(idle: Duration, failure_backoff: Duration) -> Self {
        Self {
            idle,
            failure_backoff,
        }
    }
}

impl Default for StageTiming {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(500))
    }
}

/// Sleep for `duration` unless a stop signal arrives first.
///
/// Returns true if the caller should stop.
pub fn pause(stop: &Receiver<()>, duration: Duration) -> bool {
    match stop.recv_timeout(duration) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}
