//! Returning acknowledgments to reporting agents.

use crate::error::{Result, TransportError};
use crate::model::{AckRecord, SequenceNo, SourceKey};
use crate::queue::BoundedQueue;
use crate::stage::{Stage, StepOutcome};
use crate::window::WindowRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Transport carrying acknowledgments back to an agent
pub trait AckSink: Send + Sync {
    fn send_acks(&self, source: &SourceKey, sequence_nos: &[SequenceNo]) -> std::result::Result<(), TransportError>;
}

/// Confirms acknowledged sequence numbers in the agents' windows and sends
/// them back, one call per agent.
///
/// Confirmation happens before sending, so a lost ACK is recovered when the
/// agent resends and its window answers with a re-ack.
pub struct AckStage {
    input: Arc<BoundedQueue<AckRecord>>,
    windows: Arc<WindowRegistry>,
    sink: Arc<dyn AckSink>,
    batch_size: usize,
}

impl AckStage {
    pub fn new(
        input: Arc<BoundedQueue<AckRecord>>,
        windows: Arc<WindowRegistry>,
        sink: Arc<dyn AckSink>,
        batch_size: usize,
    ) -> Self {
        Self {
            input,
            windows,
            sink,
            batch_size: batch_size.max(1),
        }
    }
}

/// Group records by agent, keeping first-seen order
fn group_by_source(records: Vec<AckRecord>) -> Vec<(SourceKey, Vec<SequenceNo>)> {
    let mut groups: Vec<(SourceKey, Vec<SequenceNo>)> = Vec::new();
    for record in records {
        let source = record.source_key();
        match groups.iter_mut().find(|(key, _)| *key == source) {
            Some((_, seqs)) => seqs.push(record.sequence_no),
            None => groups.push((source, vec![record.sequence_no])),
        }
    }
    groups
}

impl Stage for AckStage {
    fn step(&mut self) -> Result<StepOutcome> {
        let records = self.input.drain(self.batch_size);
        if records.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let count = records.len();
        for (source, seqs) in group_by_source(records) {
            for &seq in &seqs {
                self.windows.confirm(&source, seq);
            }
            match self.sink.send_acks(&source, &seqs) {
                Ok(()) => debug!(source = %source, count = seqs.len(), "acks sent"),
                Err(e) => warn!(source = %source, count = seqs.len(), error = %e, "acks not delivered"),
            }
        }
        Ok(StepOutcome::Processed(count))
    }

    fn name(&self) -> &str {
        "ack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Admission;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(SourceKey, Vec<SequenceNo>)>>,
    }

    impl AckSink for RecordingSink {
        fn send_acks(&self, source: &SourceKey, sequence_nos: &[SequenceNo]) -> std::result::Result<(), TransportError> {
            self.sent.lock().push((source.clone(), sequence_nos.to_vec()));
            Ok(())
        }
    }

    struct FailingSink;

    impl AckSink for FailingSink {
        fn send_acks(&self, _: &SourceKey, _: &[SequenceNo]) -> std::result::Result<(), TransportError> {
            Err(TransportError::Unreachable("agent gone".into()))
        }
    }

    fn record(port: i32, seq: SequenceNo) -> AckRecord {
        AckRecord {
            address: "10.0.0.1".into(),
            port,
            sequence_no: seq,
        }
    }

    #[test]
    fn test_groups_per_agent() {
        let input = Arc::new(BoundedQueue::new(16));
        for ack in [record(1, 5), record(2, 7), record(1, 6)] {
            input.offer(ack).unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let mut stage = AckStage::new(input, Arc::new(WindowRegistry::new(8)), sink.clone(), 10);

        assert_eq!(stage.step().unwrap(), StepOutcome::Processed(3));
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (SourceKey::new("10.0.0.1", 1), vec![5, 6]));
        assert_eq!(sent[1], (SourceKey::new("10.0.0.1", 2), vec![7]));
    }

    #[test]
    fn test_confirms_window_even_if_send_fails() {
        let input = Arc::new(BoundedQueue::new(16));
        let windows = Arc::new(WindowRegistry::new(8));
        let source = SourceKey::new("10.0.0.1", 1);
        assert_eq!(windows.admit(&source, 5), Admission::Accept);
        input.offer(record(1, 5)).unwrap();

        let mut stage = AckStage::new(Arc::clone(&input), Arc::clone(&windows), Arc::new(FailingSink), 10);
        assert_eq!(stage.step().unwrap(), StepOutcome::Processed(1));
        assert_eq!(windows.admit(&source, 5), Admission::DropAndAck);
        assert_eq!(stage.step().unwrap(), StepOutcome::Idle);
    }
}
