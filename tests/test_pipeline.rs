use chrono::{TimeZone, Utc};
use fault_pipeline::{
    AckSink, AlarmCategory, AlarmDefinition, AlarmEntry, AlarmStore, AlarmsMessage, FaultConfig,
    FaultError, LocationParam, MemoryAlarmStore, NorthboundClient, PipelineBuilder, ReportBatch,
    ResponseCode, SequenceNo, SourceKey, StaticReferenceData, TransportError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingClient {
    batches: Mutex<Vec<ReportBatch>>,
}

impl NorthboundClient for RecordingClient {
    fn send_alarms(&self, batch: &ReportBatch) -> Result<(), TransportError> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

impl RecordingClient {
    fn reported(&self) -> usize {
        self.batches.lock().iter().map(|batch| batch.alarms.len()).sum()
    }
}

#[derive(Default)]
struct RecordingSink {
    acks: Mutex<Vec<(SourceKey, SequenceNo)>>,
}

impl AckSink for RecordingSink {
    fn send_acks(&self, source: &SourceKey, sequence_nos: &[SequenceNo]) -> Result<(), TransportError> {
        let mut acks = self.acks.lock();
        acks.extend(sequence_nos.iter().map(|&seq| (source.clone(), seq)));
        Ok(())
    }
}

impl RecordingSink {
    fn count(&self, seq: SequenceNo) -> usize {
        self.acks.lock().iter().filter(|(_, s)| *s == seq).count()
    }
}

fn wait_until(check: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn config() -> FaultConfig {
    let mut config = FaultConfig::default();
    config.window_size = 16;
    config.stages.idle_ms = 10;
    config.stages.failure_backoff_ms = 10;
    config.stages.shutdown_timeout_ms = 2000;
    config.pool.min_threads = 4;
    config.pool.max_threads = 6;
    config
}

fn reference() -> StaticReferenceData {
    let definition = |id: &str, default_severity| AlarmDefinition {
        alarm_id: id.to_string(),
        external_id: format!("EXT-{id}"),
        default_severity,
        display_masked: false,
    };
    StaticReferenceData::new()
        .with_definition(
            definition("100", 2),
            vec![LocationParam::key("board"), LocationParam::info("slot")],
        )
        .with_definition(
            definition("200", 4),
            vec![LocationParam::key("board"), LocationParam::key("port")],
        )
}

fn entry(alarm_id: i64, seq: SequenceNo, category: AlarmCategory, location: &str) -> AlarmEntry {
    AlarmEntry {
        alarm_id,
        sequence_no: seq,
        category: category.code(),
        severity: Some(3),
        cause: 11,
        occur_time: Utc
            .timestamp_opt(1_700_000_000 + seq, 0)
            .single()
            .unwrap(),
        managed_object: "Board".into(),
        resource_id: "ne-1".into(),
        location_info: location.into(),
        additional_info: Some("link down".into()),
    }
}

fn message(alarms: Vec<AlarmEntry>) -> AlarmsMessage {
    AlarmsMessage {
        agent_address: Some("10.0.0.1".into()),
        agent_port: 9001,
        alarms,
    }
}

struct Running {
    store: Arc<MemoryAlarmStore>,
    client: Arc<RecordingClient>,
    sink: Arc<RecordingSink>,
    pipeline: fault_pipeline::FaultPipeline,
}

fn start(config: FaultConfig) -> Running {
    let store = Arc::new(MemoryAlarmStore::new());
    let client = Arc::new(RecordingClient::default());
    let sink = Arc::new(RecordingSink::default());
    let pipeline = PipelineBuilder::new(config)
        .with_store(store.clone())
        .with_reference_data(Arc::new(reference()))
        .with_northbound(client.clone())
        .with_ack_sink(sink.clone())
        .build()
        .expect("Pipeline build failed");
    pipeline.start().expect("Pipeline start failed");
    Running {
        store,
        client,
        sink,
        pipeline,
    }
}

#[test]
fn test_alarm_stored_reported_and_acked() {
    let run = start(config());
    let ingress = run.pipeline.ingress();

    let code = ingress.receive(message(vec![entry(100, 5, AlarmCategory::Alarm, "A,B")]));
    assert_eq!(code, ResponseCode::Success);
    assert!(wait_until(|| run.sink.count(5) == 1));

    let active = run.store.active_rows();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].external_id, "EXT-100");
    assert!(wait_until(|| run.client.reported() == 1));

    // confirmed sequence is re-acked without reprocessing
    ingress.receive(message(vec![entry(100, 5, AlarmCategory::Alarm, "A,B")]));
    assert!(wait_until(|| run.sink.count(5) == 2));
    assert_eq!(run.store.update_log().len(), 1);

    ingress.receive(message(vec![entry(100, 6, AlarmCategory::Clear, "A")]));
    assert!(wait_until(|| run.sink.count(6) == 1));
    assert!(!run.store.active_rows()[0].is_active());
    assert_eq!(run.store.clear_log().len(), 1);
    assert!(wait_until(|| run.client.reported() == 2));

    run.pipeline.shutdown();
    assert_eq!(
        ingress.receive(message(vec![entry(100, 7, AlarmCategory::Alarm, "A,B")])),
        ResponseCode::Failed
    );
}

#[test]
fn test_invalid_report_acked_not_stored() {
    let run = start(config());
    let ingress = run.pipeline.ingress();

    let mut unknown = entry(999, 5, AlarmCategory::Alarm, "A,B");
    unknown.additional_info = None;
    ingress.receive(message(vec![unknown, entry(100, 6, AlarmCategory::Alarm, "A")]));

    assert!(wait_until(|| run.sink.count(5) == 1 && run.sink.count(6) == 1));
    assert!(run.store.active_rows().is_empty());
    run.pipeline.shutdown();
}

#[test]
fn test_store_outage_recovers() {
    let run = start(config());
    run.store.fail_next_batches(3);

    run.pipeline
        .ingress()
        .receive(message(vec![entry(100, 5, AlarmCategory::Alarm, "A,B")]));
    assert!(wait_until(|| run.sink.count(5) == 1));
    assert_eq!(run.store.active_rows().len(), 1);

    let store_metrics = run.pipeline.stage_metrics("store").unwrap();
    assert!(store_metrics.failures >= 3);
    run.pipeline.shutdown();
}

#[test]
fn test_held_merge_alarms_flushed_on_shutdown() {
    let mut config = config();
    config.diverse_source.alarm_ids = vec!["200".into()];
    config.diverse_source.hold_secs = 3600;
    let run = start(config);

    run.pipeline
        .ingress()
        .receive(message(vec![entry(200, 5, AlarmCategory::Alarm, "A,B")]));
    assert!(wait_until(|| {
        run.pipeline
            .stage_metrics("pretreat")
            .is_some_and(|metrics| metrics.processed == 1)
    }));
    assert!(run.store.active_rows().is_empty());
    assert!(run.pipeline.metrics_summary().contains("held=1"));

    run.pipeline.shutdown();
    assert_eq!(run.store.active_rows().len(), 1);
}

#[test]
fn test_start_twice_fails() {
    let run = start(config());
    assert!(matches!(run.pipeline.start(), Err(FaultError::AlreadyStarted)));
    assert!(run.pipeline.is_running());
    run.pipeline.shutdown();
    assert!(!run.pipeline.is_running());
}

#[test]
fn test_build_requires_collaborators() {
    let result = PipelineBuilder::new(config())
        .with_reference_data(Arc::new(reference()))
        .build();
    assert!(matches!(result, Err(FaultError::Config(_))));
}

#[test]
fn test_unreadable_store_aborts_build() {
    let store = Arc::new(MemoryAlarmStore::new());
    store.set_queries_available(false);
    let result = PipelineBuilder::new(config())
        .with_store(store)
        .with_reference_data(Arc::new(reference()))
        .with_northbound(Arc::new(RecordingClient::default()))
        .with_ack_sink(Arc::new(RecordingSink::default()))
        .build();
    assert!(matches!(result, Err(FaultError::Startup(_))));
}

#[test]
fn test_manual_clear_through_engine() {
    let run = start(config());
    run.pipeline
        .ingress()
        .receive(message(vec![entry(100, 5, AlarmCategory::Alarm, "A,B")]));
    assert!(wait_until(|| run.sink.count(5) == 1));

    let key = run.store.active_rows()[0].key();
    let cleared = run
        .pipeline
        .engine()
        .manual_clear(&key, Utc::now())
        .unwrap();
    assert_eq!(cleared, 1);
    assert_eq!(run.store.count_rows(fault_pipeline::Table::ClearLog).unwrap(), 1);
    run.pipeline.shutdown();
}
