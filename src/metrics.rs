use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency samples in nanoseconds
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// Median in milliseconds
    pub fn p50_ms(&self) -> f64 {
        self.percentile(0.50)
    }

    /// 99th percentile in milliseconds
    pub fn p99_ms(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let measurements = self.measurements.lock();
        if measurements.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1_000_000.0
    }

    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

/// Counters for one pipeline stage, shared between its worker and observers
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Cycles that moved work
    cycles: Arc<AtomicU64>,
    /// Items handled across all cycles
    items_processed: Arc<AtomicU64>,
    /// Cycles that found nothing to do or a full output
    idle_cycles: Arc<AtomicU64>,
    /// Cycles that returned an error or panicked
    failures: Arc<AtomicU64>,
    cycle_latency: PercentileTracker,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            cycles: Arc::new(AtomicU64::new(0)),
            items_processed: Arc::new(AtomicU64::new(0)),
            idle_cycles: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            cycle_latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    /// Record a cycle that handled `items` and took `elapsed`
    pub fn record_cycle(&self, items: usize, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.items_processed
            .fetch_add(items as u64, Ordering::Relaxed);
        self.cycle_latency.record(elapsed.as_nanos() as u64);
    }

    pub fn record_idle(&self) {
        self.idle_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn total_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    pub fn total_idle(&self) -> u64 {
        self.idle_cycles.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Items per second since the stage was created
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.total_cycles(),
            processed: self.total_processed(),
            idle: self.total_idle(),
            failures: self.total_failures(),
            throughput: self.throughput(),
            cycle_p50_ms: self.cycle_latency.p50_ms(),
            cycle_p99_ms: self.cycle_latency.p99_ms(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`StageMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub processed: u64,
    pub idle: u64,
    pub failures: u64,
    pub throughput: f64,
    pub cycle_p50_ms: f64,
    pub cycle_p99_ms: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Cycles: {}, Processed: {}, Idle: {}, Failures: {}, Throughput: {:.2} items/s, \
             Cycle P50: {:.3}ms, P99: {:.3}ms, Elapsed: {:.2}s",
            self.cycles,
            self.processed,
            self.idle,
            self.failures,
            self.throughput,
            self.cycle_p50_ms,
            self.cycle_p99_ms,
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_tracker() {
        let tracker = PercentileTracker::new(10);
        for i in 1..=20 {
            tracker.record(i * 1_000_000);
        }
        assert_eq!(tracker.count(), 10);
        assert_eq!(tracker.p50_ms(), 15.0);
        assert_eq!(tracker.p99_ms(), 20.0);
    }

    #[test]
    fn test_stage_metrics_counts() {
        let metrics = StageMetrics::new();
        metrics.record_cycle(5, Duration::from_millis(2));
        metrics.record_cycle(3, Duration::from_millis(4));
        metrics.record_idle();
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.processed, 8);
        assert_eq!(snapshot.idle, 1);
        assert_eq!(snapshot.failures, 1);
        assert!(snapshot.format().contains("Processed: 8"));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = StageMetrics::new();
        let observer = metrics.clone();
        metrics.record_cycle(1, Duration::from_micros(10));
        assert_eq!(observer.total_processed(), 1);
    }
}
