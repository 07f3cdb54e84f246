//! Wiring of the fault pipeline: queues, stages, workers and maintenance.

use crate::ack::{AckSink, AckStage};
use crate::config::FaultConfig;
use crate::correlation::{CorrelationEngine, CorrelationQueues, CorrelationStage};
use crate::dao::{AlarmStore, HistoryArchiver, LogOnlyArchiver};
use crate::diverse::DiverseSourceCache;
use crate::error::{FaultError, Result};
use crate::ingress::AlarmIngress;
use crate::metrics::MetricsSnapshot;
use crate::model::{AckRecord, CanonicalAlarm, RawAlarmReport};
use crate::pool::{ScheduledTask, WorkerPool};
use crate::pretreat::PretreatmentStage;
use crate::queue::BoundedQueue;
use crate::reference::ReferenceData;
use crate::report::{NorthboundClient, ReportStage};
use crate::stage::PipelineStage;
use crate::window::WindowRegistry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Long-running stages, each holding one worker for its lifetime
const STAGE_WORKERS: usize = 4;

/// Builder for a [`FaultPipeline`]
pub struct PipelineBuilder {
    config: FaultConfig,
    store: Option<Arc<dyn AlarmStore>>,
    reference: Option<Arc<dyn ReferenceData>>,
    northbound: Option<Arc<dyn NorthboundClient>>,
    ack_sink: Option<Arc<dyn AckSink>>,
    archiver: Option<Arc<dyn HistoryArchiver>>,
}

impl PipelineBuilder {
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            store: None,
            reference: None,
            northbound: None,
            ack_sink: None,
            archiver: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AlarmStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_reference_data(mut self, reference: Arc<dyn ReferenceData>) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_northbound(mut self, client: Arc<dyn NorthboundClient>) -> Self {
        self.northbound = Some(client);
        self
    }

    pub fn with_ack_sink(mut self, sink: Arc<dyn AckSink>) -> Self {
        self.ack_sink = Some(sink);
        self
    }

    /// Archiver for the clear log; without one, overflow is only logged
    pub fn with_archiver(mut self, archiver: Arc<dyn HistoryArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Validate the configuration and create every component.
    ///
    /// Fails if a collaborator is missing, the store cannot be read, or the
    /// worker pool cannot be created.
    pub fn build(self) -> Result<FaultPipeline> {
        let config = self.config;
        config.validate()?;
        let store = self
            .store
            .ok_or_else(|| FaultError::Config("no alarm store configured".into()))?;
        let reference = self
            .reference
            .ok_or_else(|| FaultError::Config("no reference data configured".into()))?;
        let northbound = self
            .northbound
            .ok_or_else(|| FaultError::Config("no northbound client configured".into()))?;
        let ack_sink = self
            .ack_sink
            .ok_or_else(|| FaultError::Config("no ack sink configured".into()))?;
        let archiver = self
            .archiver
            .unwrap_or_else(|| Arc::new(LogOnlyArchiver));

        let intake: Arc<BoundedQueue<RawAlarmReport>> = Arc::new(BoundedQueue::new(config.queues.intake));
        let pretreated: Arc<BoundedQueue<CanonicalAlarm>> =
            Arc::new(BoundedQueue::new(config.queues.pretreated));
        let report: Arc<BoundedQueue<CanonicalAlarm>> = Arc::new(BoundedQueue::new(config.queues.report));
        let acks: Arc<BoundedQueue<AckRecord>> = Arc::new(BoundedQueue::new(config.queues.ack));

        let windows = Arc::new(WindowRegistry::new(config.window_size));
        let diverse = Arc::new(DiverseSourceCache::new(
            config.diverse_source.alarm_ids.iter().cloned(),
            Duration::from_secs(config.diverse_source.hold_secs),
        ));
        let ingress = Arc::new(AlarmIngress::new(
            Arc::clone(&windows),
            Arc::clone(&intake),
            Arc::clone(&acks),
        ));
        let engine = Arc::new(CorrelationEngine::new(
            config.correlation_settings(),
            CorrelationQueues {
                to_store: Arc::clone(&pretreated),
                report: Arc::clone(&report),
                acks: Arc::clone(&acks),
            },
            store,
            Arc::clone(&reference),
            Arc::clone(&diverse),
            archiver,
        )?);

        let timing = config.stage_timing();
        let stages = vec![
            PipelineStage::new(
                PretreatmentStage::new(
                    Arc::clone(&intake),
                    Arc::clone(&pretreated),
                    Arc::clone(&acks),
                    reference,
                    Arc::clone(&diverse),
                ),
                timing,
            ),
            PipelineStage::new(CorrelationStage::new(Arc::clone(&engine)), timing),
            PipelineStage::new(
                ReportStage::new(
                    Arc::clone(&report),
                    northbound,
                    config.northbound.address.clone(),
                    config.northbound.port,
                    config.stages.report_batch_size,
                ),
                timing,
            ),
            PipelineStage::new(
                AckStage::new(
                    Arc::clone(&acks),
                    Arc::clone(&windows),
                    ack_sink,
                    config.stages.ack_batch_size,
                ),
                timing,
            ),
        ];

        let min_threads = config.pool.min_threads.max(STAGE_WORKERS);
        let max_threads = config.pool.max_threads.max(min_threads);
        if min_threads != config.pool.min_threads {
            debug!(min_threads, "pool raised to one worker per stage");
        }
        let pool = WorkerPool::new(
            min_threads,
            max_threads,
            Duration::from_secs(config.pool.keep_alive_secs),
        )?;

        Ok(FaultPipeline {
            config,
            windows,
            ingress,
            engine,
            diverse,
            intake,
            pretreated,
            stages,
            pool,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

/// A built pipeline. Reports enter through [`FaultPipeline::ingress`].
pub struct FaultPipeline {
    config: FaultConfig,
    windows: Arc<WindowRegistry>,
    ingress: Arc<AlarmIngress>,
    engine: Arc<CorrelationEngine>,
    diverse: Arc<DiverseSourceCache>,
    intake: Arc<BoundedQueue<RawAlarmReport>>,
    pretreated: Arc<BoundedQueue<CanonicalAlarm>>,
    /// pretreat, store, report, ack
    stages: Vec<PipelineStage>,
    pool: WorkerPool,
    tasks: Mutex<Vec<ScheduledTask>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl FaultPipeline {
    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn ingress(&self) -> Arc<AlarmIngress> {
        Arc::clone(&self.ingress)
    }

    pub fn engine(&self) -> Arc<CorrelationEngine> {
        Arc::clone(&self.engine)
    }

    pub fn windows(&self) -> Arc<WindowRegistry> {
        Arc::clone(&self.windows)
    }

    /// Start every stage and the maintenance tasks
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FaultError::AlreadyStarted);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(FaultError::Startup("pipeline was shut down".into()));
        }

        for stage in &self.stages {
            stage.start(&self.pool)?;
        }

        let mut tasks = self.tasks.lock();
        let engine = Arc::clone(&self.engine);
        let retention = Duration::from_secs(self.config.maintenance.cleared_retention_secs);
        tasks.push(ScheduledTask::spawn(
            "auto-clear",
            Duration::from_secs(self.config.maintenance.auto_clear_interval_secs),
            move || {
                if let Err(e) = engine.purge_cleared(retention) {
                    warn!(error = %e, "auto-clear sweep failed");
                }
            },
        )?);

        let diverse = Arc::clone(&self.diverse);
        let pretreated = Arc::clone(&self.pretreated);
        tasks.push(ScheduledTask::spawn(
            "diverse-sweep",
            Duration::from_secs(self.config.diverse_source.sweep_interval_secs),
            move || {
                let released = diverse.sweep(&pretreated);
                if released > 0 {
                    debug!(released, "merge groups released");
                }
            },
        )?);

        info!(stages = self.stages.len(), window_size = self.config.window_size, "fault pipeline started");
        Ok(())
    }

    /// Stop taking reports, stop the stages in flow order, store alarms
    /// still held for merge, then stop the workers.
    ///
    /// Later calls do nothing.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let timeout = self.config.shutdown_timeout();
        self.ingress.close();

        for mut task in self.tasks.lock().drain(..) {
            task.cancel();
        }

        let (flow, delivery) = self.stages.split_at(2.min(self.stages.len()));
        for stage in flow {
            stage.stop(timeout);
        }

        let held = self.diverse.drain_held();
        if !held.is_empty() {
            match self.engine.store_now(held) {
                Ok(stored) => info!(stored, "held merge alarms stored"),
                Err(e) => error!(error = %e, "held merge alarms not stored"),
            }
        }

        for stage in delivery {
            stage.stop(timeout);
        }
        if !self.pool.shutdown(timeout) {
            warn!("workers still busy after shutdown timeout");
        }

        let unprocessed = self.intake.len() + self.pretreated.len() + self.engine.pending_batch_len();
        info!(unprocessed, "fault pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Metrics of the named stage ("pretreat", "store", "report", "ack")
    pub fn stage_metrics(&self, name: &str) -> Option<MetricsSnapshot> {
        self.stages
            .iter()
            .find(|stage| stage.name() == name)
            .map(|stage| stage.metrics().snapshot())
    }

    /// One line per stage plus queue depths
    pub fn metrics_summary(&self) -> String {
        let mut lines: Vec<String> = self
            .stages
            .iter()
            .map(|stage| format!("{}: {}", stage.name(), stage.metrics().snapshot().format()))
            .collect();
        lines.push(format!(
            "queues: intake={}, pretreated={}, batch={}, held={}",
            self.intake.len(),
            self.pretreated.len(),
            self.engine.pending_batch_len(),
            self.diverse.held_len()
        ));
        lines.join("\n")
    }
}

impl Drop for FaultPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
