use crate::backpressure::{pause, StageTiming};
use crate::error::Result;
use crate::metrics::StageMetrics;
use crate::pool::WorkerPool;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of one invocation of a stage's step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Work was done; run the next step immediately
    Processed(usize),
    /// Input empty or output full; wait the idle interval
    Idle,
    /// Work could not complete and stays queued; wait the failure backoff
    Retry,
}

/// Trait for a processing stage in the pipeline
pub trait Stage: Send + 'static {
    /// Run one cycle: read from the input queue, write to the output queue
    fn step(&mut self) -> Result<StepOutcome>;

    /// Called before the first step
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after the last step
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// A stage whose step is a closure
pub struct FnStage<F>
where
    F: FnMut() -> Result<StepOutcome> + Send + 'static,
{
    name: String,
    step: F,
}

impl<F> FnStage<F>
where
    F: FnMut() -> Result<StepOutcome> + Send + 'static,
{
    pub fn new(name: impl Into<String>, step: F) -> Self {
        Self {
            name: name.into(),
            step,
        }
    }
}

impl<F> Stage for FnStage<F>
where
    F: FnMut() -> Result<StepOutcome> + Send + 'static,
{
    fn step(&mut self) -> Result<StepOutcome> {
        (self.step)()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct RunHandle {
    running: Arc<AtomicBool>,
    stop: Sender<()>,
    done: Receiver<()>,
}

enum Lifecycle {
    Ready(Box<dyn Stage>),
    Running(RunHandle),
    Stopped,
}

/// A stage bound to a worker of the pool.
///
/// A `PipelineStage` runs at most once: `start` on a running or stopped
/// stage does nothing, and a stopped stage is never restarted.
pub struct PipelineStage {
    name: String,
    timing: StageTiming,
    metrics: StageMetrics,
    state: Mutex<Lifecycle>,
}

impl PipelineStage {
    pub fn new(stage: impl Stage, timing: StageTiming) -> Self {
        Self::boxed(Box::new(stage), timing)
    }

    pub fn boxed(stage: Box<dyn Stage>, timing: StageTiming) -> Self {
        Self {
            name: stage.name().to_string(),
            timing,
            metrics: StageMetrics::new(),
            state: Mutex::new(Lifecycle::Ready(stage)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Running(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Stopped)
    }

    /// Submit the run loop to `pool`.
    ///
    /// Returns `Ok(false)` if the stage was already started or stopped.
    pub fn start(&self, pool: &WorkerPool) -> Result<bool> {
        let mut state = self.state.lock();
        let stage = match std::mem::replace(&mut *state, Lifecycle::Stopped) {
            Lifecycle::Ready(stage) => stage,
            other => {
                debug!(stage = %self.name, "start ignored, stage not ready");
                *state = other;
                return Ok(false);
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let job = StageJob {
            stage,
            running: Arc::clone(&running),
            stop: stop_rx,
            timing: self.timing,
            metrics: self.metrics.clone(),
        };

        pool.submit(move || {
            job.run();
            drop(done_tx);
        })?;

        *state = Lifecycle::Running(RunHandle {
            running,
            stop: stop_tx,
            done: done_rx,
        });
        info!(stage = %self.name, "stage started");
        Ok(true)
    }

    /// Stop the run loop, waiting up to `timeout` for the current cycle.
    ///
    /// Returns false if the loop was still inside a step at the deadline; it
    /// exits once that step returns.
    pub fn stop(&self, timeout: Duration) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), Lifecycle::Stopped);
        let RunHandle {
            running,
            stop,
            done,
        } = match previous {
            Lifecycle::Running(handle) => handle,
            Lifecycle::Ready(_) | Lifecycle::Stopped => return true,
        };

        running.store(false, Ordering::SeqCst);
        drop(stop);
        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!(stage = %self.name, "stage stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(stage = %self.name, "stage still busy at stop deadline");
                false
            }
        }
    }
}

struct StageJob {
    stage: Box<dyn Stage>,
    running: Arc<AtomicBool>,
    stop: Receiver<()>,
    timing: StageTiming,
    metrics: StageMetrics,
}

impl StageJob {
    /// Step until the run flag drops. Errors and panics in a step are logged
    /// and followed by the failure backoff; they never end the loop.
    fn run(mut self) {
        let name = self.stage.name().to_string();
        if let Err(e) = self.stage.on_start() {
            error!(stage = %name, error = %e, "stage failed to start");
            return;
        }

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            let stage = &mut self.stage;
            let wait = match catch_unwind(AssertUnwindSafe(|| stage.step())) {
                Ok(Ok(StepOutcome::Processed(0))) | Ok(Ok(StepOutcome::Idle)) => {
                    self.metrics.record_idle();
                    Some(self.timing.idle)
                }
                Ok(Ok(StepOutcome::Processed(items))) => {
                    self.metrics.record_cycle(items, started.elapsed());
                    None
                }
                Ok(Ok(StepOutcome::Retry)) => {
                    self.metrics.record_failure();
                    Some(self.timing.failure_backoff)
                }
                Ok(Err(e)) => {
                    error!(stage = %name, error = %e, "stage cycle failed");
                    self.metrics.record_failure();
                    Some(self.timing.failure_backoff)
                }
                Err(_) => {
                    error!(stage = %name, "stage cycle panicked");
                    self.metrics.record_failure();
                    Some(self.timing.failure_backoff)
                }
            };

            if let Some(duration) = wait {
                if pause(&self.stop, duration) {
                    break;
                }
            }
        }

        if let Err(e) = self.stage.on_shutdown() {
            error!(stage = %name, error = %e, "stage shutdown hook failed");
        }
    }
}
