use chrono::{TimeZone, Utc};
use fault_pipeline::{
    AckRecord, AckSink, AckStage, Admission, AlarmCategory, AlarmDefinition, BoundedQueue,
    CanonicalAlarm, ClearType, CorrelationEngine, CorrelationQueues, CorrelationSettings,
    DiverseSourceCache, LocationParam, LogOnlyArchiver, MemoryAlarmStore, SequenceNo, SourceKey,
    Stage, StaticReferenceData, StepOutcome, TransportError, WindowRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn canonical(category: AlarmCategory, location: &str, severity: i32, seq: i64) -> CanonicalAlarm {
    CanonicalAlarm {
        alarm_id: "100".into(),
        external_id: "EXT-100".into(),
        sequence_no: seq,
        category,
        severity,
        cause: "11".into(),
        occur_time: Utc.timestamp_opt(1_700_000_000 + seq, 0).single().unwrap(),
        managed_object: "Board".into(),
        resource_id: "ne-1".into(),
        location_info: location.into(),
        additional_info: "link down".into(),
        source: SourceKey::new("10.0.0.1", 9001),
        display_suppressed: false,
        clear_type: match category {
            AlarmCategory::Clear => ClearType::Cleared,
            _ => ClearType::Active,
        },
        serial_no: 0,
        sync_no: 0,
        clear_time: None,
    }
}

struct Engine {
    store: Arc<MemoryAlarmStore>,
    to_store: Arc<BoundedQueue<CanonicalAlarm>>,
    acks: Arc<BoundedQueue<AckRecord>>,
    engine: CorrelationEngine,
}

impl Engine {
    fn new(update_support: bool) -> Self {
        Self::with_ack_capacity(update_support, 32)
    }

    fn with_ack_capacity(update_support: bool, ack_capacity: usize) -> Self {
        let store = Arc::new(MemoryAlarmStore::new());
        let to_store = Arc::new(BoundedQueue::new(32));
        let acks = Arc::new(BoundedQueue::new(ack_capacity));
        let reference = StaticReferenceData::new().with_definition(
            AlarmDefinition {
                alarm_id: "100".into(),
                external_id: "EXT-100".into(),
                default_severity: 2,
                display_masked: false,
            },
            vec![LocationParam::key("board"), LocationParam::info("slot")],
        );
        let engine = CorrelationEngine::new(
            CorrelationSettings {
                update_support,
                ..Default::default()
            },
            CorrelationQueues {
                to_store: Arc::clone(&to_store),
                report: Arc::new(BoundedQueue::new(32)),
                acks: Arc::clone(&acks),
            },
            store.clone(),
            Arc::new(reference),
            Arc::new(DiverseSourceCache::new(Vec::<String>::new(), Duration::ZERO)),
            Arc::new(LogOnlyArchiver),
        )
        .expect("Engine build failed");
        Self {
            store,
            to_store,
            acks,
            engine,
        }
    }

    fn run(&self, alarms: Vec<CanonicalAlarm>) -> StepOutcome {
        for alarm in alarms {
            self.to_store.offer(alarm).expect("Queue full");
        }
        self.engine.run_cycle().expect("Cycle failed")
    }
}

#[test]
fn test_identical_resend_is_discarded() {
    let engine = Engine::new(true);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 3, 5)]);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 3, 6)]);

    assert_eq!(engine.store.active_rows().len(), 1);
    assert_eq!(engine.store.update_log().len(), 1);
}

#[test]
fn test_severity_change_is_update_with_original_sync() {
    let engine = Engine::new(true);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 3, 5)]);
    let sync_no = engine.store.active_rows()[0].sync_no;

    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 5, 6)]);
    let update = engine.store.update_log().pop().unwrap();
    assert_eq!(update.severity, 5);
    assert_eq!(update.sync_no, sync_no);
}

#[test]
fn test_clear_once_then_drop_repeats() {
    let engine = Engine::new(true);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 3, 5)]);
    engine.run(vec![canonical(AlarmCategory::Clear, "A,B", 3, 6)]);

    let active = engine.store.active_rows();
    assert_eq!(active[0].clear_type, ClearType::Cleared);
    assert_eq!(engine.store.clear_log().len(), 1);

    assert_eq!(
        engine.run(vec![canonical(AlarmCategory::Clear, "A,B", 3, 7)]),
        StepOutcome::Processed(1)
    );
    assert_eq!(engine.store.clear_log().len(), 1);
}

#[test]
fn test_resend_after_non_key_change_is_discarded() {
    let engine = Engine::new(true);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 3, 5)]);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,C", 3, 6)]);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,C", 3, 7)]);

    assert_eq!(engine.store.active_rows()[0].location_info, "A,C");
    assert_eq!(engine.store.update_log().len(), 2);
}

#[test]
fn test_severity_change_without_update_support_is_new_alarm() {
    let engine = Engine::new(false);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 3, 5)]);
    engine.run(vec![canonical(AlarmCategory::Alarm, "A,B", 5, 6)]);

    let active = engine.store.active_rows();
    assert_eq!(active.len(), 2);
    assert_ne!(active[0].sync_no, active[1].sync_no);
}

#[derive(Default)]
struct CountingSink {
    sent: AtomicUsize,
}

impl AckSink for CountingSink {
    fn send_acks(&self, _: &SourceKey, sequence_nos: &[SequenceNo]) -> Result<(), TransportError> {
        self.sent.fetch_add(sequence_nos.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_ack_queue_full_still_confirms_window() {
    let engine = Engine::with_ack_capacity(true, 1);
    let windows = Arc::new(WindowRegistry::new(16));
    let source = SourceKey::new("10.0.0.1", 9001);
    let sink = Arc::new(CountingSink::default());
    let mut ack_stage = AckStage::new(Arc::clone(&engine.acks), Arc::clone(&windows), sink.clone(), 8);

    assert_eq!(windows.admit(&source, 5), Admission::Accept);
    assert_eq!(windows.admit(&source, 6), Admission::Accept);
    engine.run(vec![
        canonical(AlarmCategory::Alarm, "A,B", 3, 5),
        canonical(AlarmCategory::Alarm, "C,D", 3, 6),
    ]);
    assert_eq!(engine.engine.held_acks_len(), 1);

    ack_stage.step().expect("Ack step failed");
    assert_eq!(windows.admit(&source, 6), Admission::DropSilent);

    assert_eq!(engine.engine.run_cycle().expect("Cycle failed"), StepOutcome::Idle);
    ack_stage.step().expect("Ack step failed");
    assert_eq!(windows.admit(&source, 6), Admission::DropAndAck);
    assert_eq!(sink.sent.load(Ordering::SeqCst), 2);
}

#[test]
fn test_never_raised_clear_leaves_no_history() {
    let engine = Engine::new(false);
    engine.run(vec![canonical(AlarmCategory::Clear, "Z,B", 3, 5)]);
    assert!(engine.store.clear_log().is_empty());
    assert!(engine.store.active_rows().is_empty());
}

#[test]
fn test_disabled_update_support_only_coarsens() {
    let base = canonical(AlarmCategory::Alarm, "A,B", 3, 1);
    let mut variants = Vec::new();
    for severity in [3, 4] {
        for info in ["link down", " link down ", "link flapping"] {
            for location in ["A,B", "A,C"] {
                let mut alarm = canonical(AlarmCategory::Alarm, location, severity, 2);
                alarm.additional_info = info.into();
                variants.push(alarm);
            }
        }
    }

    for other in &variants {
        if base.is_duplicate_of(other, true) {
            assert!(base.is_duplicate_of(other, false));
        }
    }
}
