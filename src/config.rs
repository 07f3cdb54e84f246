use crate::backpressure::StageTiming;
use crate::correlation::CorrelationSettings;
use crate::error::{FaultError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Pipeline configuration, read from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FaultConfig {
    /// Slots in each agent's acknowledgment window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Treat a changed additional info as an update rather than a duplicate
    #[serde(default = "default_true")]
    pub update_alarm_support: bool,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub stages: StageConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub diverse_source: DiverseSourceConfig,
    #[serde(default)]
    pub northbound: NorthboundConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_intake_capacity")]
    pub intake: usize,
    #[serde(default = "default_pretreated_capacity")]
    pub pretreated: usize,
    #[serde(default = "default_batch_capacity")]
    pub batch_store: usize,
    #[serde(default = "default_report_capacity")]
    pub report: usize,
    #[serde(default = "default_ack_capacity")]
    pub ack: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_max_active_rows")]
    pub max_active_rows: usize,
    #[serde(default = "default_max_history_rows")]
    pub max_history_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    #[serde(default = "default_report_batch_size")]
    pub report_batch_size: usize,
    #[serde(default = "default_ack_batch_size")]
    pub ack_batch_size: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_auto_clear_interval")]
    pub auto_clear_interval_secs: u64,
    #[serde(default = "default_cleared_retention")]
    pub cleared_retention_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiverseSourceConfig {
    /// Alarm identifiers held for cross-source merge
    #[serde(default)]
    pub alarm_ids: Vec<String>,
    #[serde(default = "default_hold_secs")]
    pub hold_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NorthboundConfig {
    #[serde(default = "default_northbound_address")]
    pub address: String,
    #[serde(default = "default_northbound_port")]
    pub port: u16,
}

fn default_window_size() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_intake_capacity() -> usize {
    6000
}

fn default_pretreated_capacity() -> usize {
    1000
}

fn default_batch_capacity() -> usize {
    500
}

fn default_report_capacity() -> usize {
    500
}

fn default_ack_capacity() -> usize {
    6000
}

fn default_max_active_rows() -> usize {
    10_000
}

fn default_max_history_rows() -> usize {
    100_000
}

fn default_min_threads() -> usize {
    6
}

fn default_max_threads() -> usize {
    12
}

fn default_keep_alive() -> u64 {
    60
}

fn default_idle_ms() -> u64 {
    500
}

fn default_failure_backoff_ms() -> u64 {
    500
}

fn default_report_batch_size() -> usize {
    500
}

fn default_ack_batch_size() -> usize {
    500
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_auto_clear_interval() -> u64 {
    3600
}

fn default_cleared_retention() -> u64 {
    86_400
}

fn default_hold_secs() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_northbound_address() -> String {
    "127.0.0.1".to_string()
}

fn default_northbound_port() -> u16 {
    80
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            intake: default_intake_capacity(),
            pretreated: default_pretreated_capacity(),
            batch_store: default_batch_capacity(),
            report: default_report_capacity(),
            ack: default_ack_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_active_rows: default_max_active_rows(),
            max_history_rows: default_max_history_rows(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            idle_ms: default_idle_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
            report_batch_size: default_report_batch_size(),
            ack_batch_size: default_ack_batch_size(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            auto_clear_interval_secs: default_auto_clear_interval(),
            cleared_retention_secs: default_cleared_retention(),
        }
    }
}

impl Default for DiverseSourceConfig {
    fn default() -> Self {
        Self {
            alarm_ids: Vec::new(),
            hold_secs: default_hold_secs(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for NorthboundConfig {
    fn default() -> Self {
        Self {
            address: default_northbound_address(),
            port: default_northbound_port(),
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            update_alarm_support: true,
            queues: QueueConfig::default(),
            storage: StorageConfig::default(),
            pool: PoolConfig::default(),
            stages: StageConfig::default(),
            maintenance: MaintenanceConfig::default(),
            diverse_source: DiverseSourceConfig::default(),
            northbound: NorthboundConfig::default(),
        }
    }
}

impl FaultConfig {
    /// Read and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size < 2 {
            return Err(FaultError::Config(format!(
                "window_size must be at least 2, got {}",
                self.window_size
            )));
        }

        let queues = [
            ("intake", self.queues.intake),
            ("pretreated", self.queues.pretreated),
            ("batch_store", self.queues.batch_store),
            ("report", self.queues.report),
            ("ack", self.queues.ack),
        ];
        if let Some((name, _)) = queues.iter().find(|(_, capacity)| *capacity == 0) {
            return Err(FaultError::Config(format!("queue {name} has zero capacity")));
        }

        if self.pool.min_threads == 0 || self.pool.min_threads > self.pool.max_threads {
            return Err(FaultError::Config(format!(
                "invalid pool size {}..{}",
                self.pool.min_threads, self.pool.max_threads
            )));
        }
        if self.stages.report_batch_size == 0 || self.stages.ack_batch_size == 0 {
            return Err(FaultError::Config("batch sizes must be positive".into()));
        }
        if self.maintenance.auto_clear_interval_secs == 0 || self.diverse_source.sweep_interval_secs == 0 {
            return Err(FaultError::Config("maintenance intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn stage_timing(&self) -> StageTiming {
        StageTiming::new(
            Duration::from_millis(self.stages.idle_ms),
            Duration::from_millis(self.stages.failure_backoff_ms),
        )
    }

    pub fn correlation_settings(&self) -> CorrelationSettings {
        CorrelationSettings {
            update_support: self.update_alarm_support,
            batch_capacity: self.queues.batch_store,
            max_active_rows: self.storage.max_active_rows,
            max_history_rows: self.storage.max_history_rows,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.stages.shutdown_timeout_ms)
    }
}
