//! Entry point for alarm reports pushed by southbound agents.

use crate::backpressure::PressureGauge;
use crate::model::{AckRecord, AlarmEntry, RawAlarmReport, SourceKey};
use crate::queue::BoundedQueue;
use crate::window::{Admission, WindowRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Status returned to the reporting agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Success,
    /// Message lacks an agent address, has a negative port, or no alarms
    InvalidParam,
    /// The pipeline is not accepting reports
    Failed,
    /// Intake queue cannot hold the message; the agent's window was reset
    Full,
}

impl ResponseCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InvalidParam => 1,
            Self::Failed => 2,
            Self::Full => 3,
        }
    }
}

/// One ingress call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmsMessage {
    pub agent_address: Option<String>,
    pub agent_port: i32,
    pub alarms: Vec<AlarmEntry>,
}

/// Admits reports through the agent's window and queues them for
/// pretreatment
pub struct AlarmIngress {
    windows: Arc<WindowRegistry>,
    intake: Arc<BoundedQueue<RawAlarmReport>>,
    acks: Arc<BoundedQueue<AckRecord>>,
    intake_pressure: PressureGauge,
    enqueue_lock: Mutex<()>,
    accepting: AtomicBool,
}

impl AlarmIngress {
    pub fn new(
        windows: Arc<WindowRegistry>,
        intake: Arc<BoundedQueue<RawAlarmReport>>,
        acks: Arc<BoundedQueue<AckRecord>>,
    ) -> Self {
        Self {
            windows,
            intake,
            acks,
            intake_pressure: PressureGauge::new("intake"),
            enqueue_lock: Mutex::new(()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Stop taking reports; later calls answer [`ResponseCode::Failed`]
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Handle one message from an agent
    pub fn receive(&self, message: AlarmsMessage) -> ResponseCode {
        if !self.is_accepting() {
            warn!("report received while pipeline is closed");
            return ResponseCode::Failed;
        }

        let address = match message.agent_address.as_deref() {
            Some(address) if message.agent_port >= 0 && !message.alarms.is_empty() => address,
            _ => {
                error!(
                    agent_port = message.agent_port,
                    alarms = message.alarms.len(),
                    "invalid alarm message"
                );
                return ResponseCode::InvalidParam;
            }
        };
        let source = SourceKey::new(address, message.agent_port);
        let reports: Vec<RawAlarmReport> = message
            .alarms
            .into_iter()
            .map(|entry| RawAlarmReport::from_entry(address, message.agent_port, entry))
            .collect();
        info!(source = %source, count = reports.len(), "alarms received");

        let admitted = self.admit(&source, reports);
        if admitted.is_empty() {
            return ResponseCode::Success;
        }

        let (valid, invalid): (Vec<_>, Vec<_>) = admitted
            .into_iter()
            .partition(|report| report.category().is_some());
        for report in invalid {
            error!(source = %source, sequence_no = report.sequence_no, category = report.category, "invalid alarm category");
            self.queue_ack(report.ack());
        }
        if valid.is_empty() {
            return ResponseCode::Success;
        }

        let _guard = self.enqueue_lock.lock();
        let count = valid.len();
        if let Err(rejected) = self.intake.offer_all(valid) {
            warn!(
                source = %source,
                count = rejected.len(),
                remaining = self.intake.remaining_capacity(),
                "intake queue full, resetting window"
            );
            self.windows.reset(&source);
            self.intake_pressure.check_and_update(&self.intake);
            return ResponseCode::Full;
        }
        self.intake_pressure.check_and_update(&self.intake);
        debug!(source = %source, count, "alarms queued for pretreatment");
        ResponseCode::Success
    }

    /// Run each report through the source's window, keeping the accepted ones
    fn admit(&self, source: &SourceKey, reports: Vec<RawAlarmReport>) -> Vec<RawAlarmReport> {
        let Some(first) = reports.first() else {
            return reports;
        };
        let window = self.windows.window(source, first.sequence_no);
        let mut window = window.lock();

        let mut accepted = Vec::with_capacity(reports.len());
        for report in reports {
            match window.admit(report.sequence_no) {
                Admission::Accept => accepted.push(report),
                Admission::DropAndAck => self.queue_ack(report.ack()),
                Admission::DropSilent => {}
            }
        }
        accepted
    }

    fn queue_ack(&self, ack: AckRecord) {
        if let Err(ack) = self.acks.offer(ack) {
            warn!(sequence_no = ack.sequence_no, address = %ack.address, "ack queue full, ack dropped");
        }
    }
}
