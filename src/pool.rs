//! Worker threads for pipeline stages and periodic maintenance.

use crate::error::{FaultError, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    max_threads: usize,
    keep_alive: Duration,
    receiver: Receiver<Job>,
    workers: AtomicUsize,
    idle: AtomicUsize,
    next_id: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Thread pool that keeps `min_threads` workers and grows to `max_threads`
/// while every worker is busy. Workers above the minimum retire after
/// `keep_alive` without work.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(min_threads: usize, max_threads: usize, keep_alive: Duration) -> Result<Self> {
        if min_threads == 0 || min_threads > max_threads {
            return Err(FaultError::Pool(format!(
                "invalid pool size: min {min_threads}, max {max_threads}"
            )));
        }

        let (sender, receiver) = channel::unbounded();
        let pool = Self {
            sender: Mutex::new(Some(sender)),
            shared: Arc::new(PoolShared {
                max_threads,
                keep_alive,
                receiver,
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        };
        for _ in 0..min_threads {
            pool.spawn_worker(true)?;
        }
        info!(min_threads, max_threads, "worker pool ready");
        Ok(pool)
    }

    /// Queue a job, adding a worker if none is idle and the pool may grow
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(FaultError::Pool("pool is shut down".into()));
        };

        if self.shared.idle.load(Ordering::SeqCst) == 0
            && self.shared.workers.load(Ordering::SeqCst) < self.shared.max_threads
        {
            self.spawn_worker(false)?;
        }

        sender
            .send(Box::new(job))
            .map_err(|_| FaultError::Pool("pool workers are gone".into()))
    }

    /// Live worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    /// Workers waiting for a job
    pub fn idle_count(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs and wait up to `timeout` for workers to finish
    /// what they are running.
    ///
    /// Returns false if some worker was still busy at the deadline; those
    /// threads are left detached.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.sender.lock().take().is_none() {
            return true;
        }
        info!("worker pool shutting down");

        let deadline = Instant::now() + timeout;
        let handles = std::mem::take(&mut *self.shared.handles.lock());
        let mut clean = true;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if !handle.is_finished() {
                warn!("worker still busy at shutdown deadline");
                clean = false;
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        clean
    }

    fn spawn_worker(&self, core: bool) -> Result<()> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        shared.workers.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(format!("fault-worker-{id}"))
            .spawn(move || worker_loop(&shared, id, core));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.workers.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let mut handles = self.shared.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
        debug!(worker = id, core, "worker spawned");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.lock().take();
    }
}

fn worker_loop(shared: &PoolShared, id: usize, core: bool) {
    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let received = if core {
            shared
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            shared.receiver.recv_timeout(shared.keep_alive)
        };
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(worker = id, "job panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(worker = id, "idle worker retiring");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.workers.fetch_sub(1, Ordering::SeqCst);
}

/// A periodic job on its own thread, stopped on [`cancel`](Self::cancel) or drop
pub struct ScheduledTask {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `task` every `interval`, first after one interval has passed
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut task: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let task_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("fault-sched-{name}"))
            .spawn(move || {
                let ticker = channel::tick(interval);
                loop {
                    channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                                error!(task = %task_name, "scheduled task panicked");
                            }
                        }
                    }
                }
                debug!(task = %task_name, "scheduled task stopped");
            })?;

        info!(task = %name, interval_ms = interval.as_millis() as u64, "scheduled task started");
        Ok(Self {
            name,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the task, waiting for an in-progress run to finish
    pub fn cancel(&mut self) {
        // dropping the sender disconnects the stop channel
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = %self.name, "scheduled task thread panicked");
            }
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
