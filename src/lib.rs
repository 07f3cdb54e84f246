//! Alarm ingestion and correlation pipeline for telecom fault management.
//!
//! Agents push alarm reports through [`AlarmIngress`]. Each agent's sequence
//! numbers pass a sliding acknowledgment window, so retries never reach the
//! pipeline twice. Admitted reports are validated and enriched, correlated
//! against the active alarms in batches, stored in one transaction per batch,
//! reported northbound and acknowledged back to the agent.
//!
//! # Features
//!
//! - Per-agent acknowledgment windows with restart and skew recovery
//! - Bounded queues between stages; a full queue makes a stage back off
//! - New / duplicate / update / clear decisions with location-parameter
//!   aware matching
//! - Retry of failed store transactions without losing or double-storing alarms
//! - Holding of alarms reported by several sources until they can be merged
//! - Per-stage metrics: cycles, throughput, cycle latency percentiles
//!
//! # Example
//!
//! ```ignore
//! use fault_pipeline::{FaultConfig, MemoryAlarmStore, PipelineBuilder, StaticReferenceData};
//! use std::sync::Arc;
//!
//! let pipeline = PipelineBuilder::new(FaultConfig::load("fault.toml")?)
//!     .with_store(Arc::new(MemoryAlarmStore::new()))
//!     .with_reference_data(Arc::new(StaticReferenceData::load("alarms.toml")?))
//!     .with_northbound(client)
//!     .with_ack_sink(sink)
//!     .build()?;
//!
//! pipeline.start()?;
//! let code = pipeline.ingress().receive(message);
//! // ...
//! pipeline.shutdown();
//! ```

pub mod ack;
pub mod backpressure;
pub mod config;
pub mod correlation;
pub mod dao;
pub mod diverse;
pub mod error;
pub mod ingress;
pub mod matching;
pub mod memory_store;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod pretreat;
pub mod queue;
pub mod reference;
pub mod report;
pub mod runtime;
pub mod stage;
pub mod window;

// Re-exports for convenience
pub use ack::{AckSink, AckStage};
pub use backpressure::{PressureGauge, StageTiming};
pub use config::FaultConfig;
pub use correlation::{CorrelationEngine, CorrelationQueues, CorrelationSettings, CorrelationStage};
pub use dao::{AlarmStore, BatchTransaction, HistoryArchiver, LogOnlyArchiver, NumberCounters, Table};
pub use diverse::DiverseSourceCache;
pub use error::{FaultError, Result, StoreError, TransportError};
pub use ingress::{AlarmIngress, AlarmsMessage, ResponseCode};
pub use memory_store::MemoryAlarmStore;
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use model::{
    AckRecord, AlarmCategory, AlarmEntry, AlarmKey, CanonicalAlarm, ClearType, RawAlarmReport,
    SequenceNo, SourceKey,
};
pub use pool::{ScheduledTask, WorkerPool};
pub use pretreat::{PretreatmentStage, Rejection};
pub use queue::BoundedQueue;
pub use reference::{AlarmDefinition, LocationParam, ReferenceData, StaticReferenceData};
pub use report::{NorthboundClient, ReportBatch, ReportStage};
pub use runtime::{FaultPipeline, PipelineBuilder};
pub use stage::{FnStage, PipelineStage, Stage, StepOutcome};
pub use window::{AckWindow, Admission, WindowRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
