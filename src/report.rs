//! Northbound reporting of correlation results.

use crate::error::{Result, TransportError};
use crate::model::CanonicalAlarm;
use crate::queue::BoundedQueue;
use crate::stage::{Stage, StepOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// One northbound call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBatch {
    pub address: String,
    pub port: u16,
    pub alarms: Vec<CanonicalAlarm>,
}

/// Client of the northbound management system
pub trait NorthboundClient: Send + Sync {
    fn send_alarms(&self, batch: &ReportBatch) -> std::result::Result<(), TransportError>;
}

/// Forwards the report queue northbound in batches.
///
/// Delivery is at most once: a batch the client fails to send is logged and
/// dropped.
pub struct ReportStage {
    input: Arc<BoundedQueue<CanonicalAlarm>>,
    client: Arc<dyn NorthboundClient>,
    address: String,
    port: u16,
    batch_size: usize,
}

impl ReportStage {
    pub fn new(
        input: Arc<BoundedQueue<CanonicalAlarm>>,
        client: Arc<dyn NorthboundClient>,
        address: impl Into<String>,
        port: u16,
        batch_size: usize,
    ) -> Self {
        Self {
            input,
            client,
            address: address.into(),
            port,
            batch_size: batch_size.max(1),
        }
    }
}

impl Stage for ReportStage {
    fn step(&mut self) -> Result<StepOutcome> {
        let alarms = self.input.drain(self.batch_size);
        if alarms.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let count = alarms.len();
        let batch = ReportBatch {
            address: self.address.clone(),
            port: self.port,
            alarms,
        };
        match self.client.send_alarms(&batch) {
            Ok(()) => debug!(count, address = %self.address, port = self.port, "alarms reported"),
            Err(e) => error!(count, address = %self.address, port = self.port, error = %e, "report failed, batch dropped"),
        }
        Ok(StepOutcome::Processed(count))
    }

    fn name(&self) -> &str {
        "report"
    }
}
