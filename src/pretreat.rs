use crate::diverse::DiverseSourceCache;
use crate::error::Result;
use crate::matching::split_params;
use crate::model::{
    AckRecord, AlarmCategory, CanonicalAlarm, ClearType, RawAlarmReport, SourceKey, MAX_SEVERITY,
    MIN_SEVERITY,
};
use crate::queue::BoundedQueue;
use crate::reference::ReferenceData;
use crate::stage::{Stage, StepOutcome};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Reports handled per step before yielding back to the run loop
const STEP_BATCH: usize = 100;

/// Why a raw report was discarded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("no definition for alarm {0}")]
    UnknownAlarm(i64),

    #[error("invalid category code {0}")]
    UnknownCategory(i32),

    #[error("invalid source port {0}")]
    InvalidPort(i32),

    #[error("empty managed object type")]
    EmptyManagedObject,

    #[error("empty location info")]
    EmptyLocation,

    #[error("empty resource id")]
    EmptyResource,

    #[error("missing additional info")]
    MissingAdditionalInfo,

    #[error("blank source address")]
    BlankSourceAddress,

    #[error("no location schema for alarm {0}")]
    MissingSchema(i64),

    #[error("{category:?} has {actual} location parameters, schema defines {defined}")]
    LocationCount {
        category: AlarmCategory,
        actual: usize,
        defined: usize,
    },
}

/// Validate a raw report and build its canonical form
pub fn canonicalize(
    report: &RawAlarmReport,
    reference: &dyn ReferenceData,
) -> std::result::Result<CanonicalAlarm, Rejection> {
    let alarm_id = report.alarm_id.to_string();
    let definition = reference
        .definition(&alarm_id)
        .ok_or(Rejection::UnknownAlarm(report.alarm_id))?;
    let category = report
        .category()
        .ok_or(Rejection::UnknownCategory(report.category))?;

    if report.source_port < 0 {
        return Err(Rejection::InvalidPort(report.source_port));
    }
    if report.managed_object.trim().is_empty() {
        return Err(Rejection::EmptyManagedObject);
    }
    if report.location_info.trim().is_empty() {
        return Err(Rejection::EmptyLocation);
    }
    if report.resource_id.trim().is_empty() {
        return Err(Rejection::EmptyResource);
    }
    let additional_info = report
        .additional_info
        .as_deref()
        .ok_or(Rejection::MissingAdditionalInfo)?;
    if report.source_address.trim().is_empty() {
        return Err(Rejection::BlankSourceAddress);
    }

    let schema = reference
        .location_schema(&alarm_id)
        .ok_or(Rejection::MissingSchema(report.alarm_id))?;
    let actual = split_params(&report.location_info).len();
    let fits = match category {
        AlarmCategory::Alarm => actual == schema.len(),
        // trailing schema parameters are optional on clears and events
        AlarmCategory::Clear | AlarmCategory::Event => actual <= schema.len(),
    };
    if !fits {
        return Err(Rejection::LocationCount {
            category,
            actual,
            defined: schema.len(),
        });
    }

    let severity = report
        .severity
        .filter(|severity| (MIN_SEVERITY..=MAX_SEVERITY).contains(severity))
        .unwrap_or(definition.default_severity);

    Ok(CanonicalAlarm {
        alarm_id,
        external_id: definition.external_id,
        sequence_no: report.sequence_no,
        category,
        severity,
        cause: report.cause.to_string(),
        occur_time: report.occur_time,
        managed_object: report.managed_object.trim().to_string(),
        resource_id: report.resource_id.trim().to_string(),
        location_info: report.location_info.trim().to_string(),
        additional_info: additional_info.trim().to_string(),
        source: SourceKey::new(report.source_address.trim(), report.source_port),
        display_suppressed: false,
        clear_type: match category {
            AlarmCategory::Clear => ClearType::Cleared,
            AlarmCategory::Alarm | AlarmCategory::Event => ClearType::Active,
        },
        serial_no: 0,
        sync_no: 0,
        clear_time: None,
    })
}

/// Validates and enriches raw reports, then hands them to correlation or to
/// the diverse-source cache.
///
/// A report is removed from the intake only after it has been placed
/// downstream, so a full output leaves it for the next step.
pub struct PretreatmentStage {
    input: Arc<BoundedQueue<RawAlarmReport>>,
    output: Arc<BoundedQueue<CanonicalAlarm>>,
    acks: Arc<BoundedQueue<AckRecord>>,
    reference: Arc<dyn ReferenceData>,
    diverse: Arc<DiverseSourceCache>,
}

impl PretreatmentStage {
    pub fn new(
        input: Arc<BoundedQueue<RawAlarmReport>>,
        output: Arc<BoundedQueue<CanonicalAlarm>>,
        acks: Arc<BoundedQueue<AckRecord>>,
        reference: Arc<dyn ReferenceData>,
        diverse: Arc<DiverseSourceCache>,
    ) -> Self {
        Self {
            input,
            output,
            acks,
            reference,
            diverse,
        }
    }

    /// Handle the head report. Returns false if it had to stay queued.
    fn process_head(&self, report: &RawAlarmReport) -> bool {
        let alarm = match canonicalize(report, self.reference.as_ref()) {
            Ok(alarm) => alarm,
            Err(rejection) => {
                warn!(
                    source = %report.source_key(),
                    sequence_no = report.sequence_no,
                    alarm_id = report.alarm_id,
                    %rejection,
                    "report rejected"
                );
                if self.acks.offer(report.ack()).is_err() {
                    warn!(sequence_no = report.sequence_no, "ack queue full, rejected report kept");
                    return false;
                }
                self.input.poll();
                return true;
            }
        };

        if self.diverse.requires_merge(&alarm.alarm_id) {
            self.diverse.put(alarm);
            self.input.poll();
            return true;
        }

        let sequence_no = alarm.sequence_no;
        if self.output.offer(alarm).is_err() {
            error!(
                sequence_no,
                input = self.input.len(),
                output = self.output.len(),
                "store queue full, report kept"
            );
            return false;
        }
        self.input.poll();
        true
    }
}

impl Stage for PretreatmentStage {
    fn step(&mut self) -> Result<StepOutcome> {
        let mut handled = 0;
        while handled < STEP_BATCH {
            if self.output.is_full() {
                debug!("store queue full");
                break;
            }
            let Some(report) = self.input.peek() else {
                break;
            };
            if !self.process_head(&report) {
                break;
            }
            handled += 1;
        }

        Ok(if handled == 0 {
            StepOutcome::Idle
        } else {
            StepOutcome::Processed(handled)
        })
    }

    fn name(&self) -> &str {
        "pretreat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::raw;
    use crate::reference::fixtures::reference;
    use std::time::Duration;

    struct Fixture {
        input: Arc<BoundedQueue<RawAlarmReport>>,
        output: Arc<BoundedQueue<CanonicalAlarm>>,
        acks: Arc<BoundedQueue<AckRecord>>,
        diverse: Arc<DiverseSourceCache>,
        stage: PretreatmentStage,
    }

    fn fixture(output_capacity: usize) -> Fixture {
        fixture_with(output_capacity, 16)
    }

    fn fixture_with(output_capacity: usize, ack_capacity: usize) -> Fixture {
        let input = Arc::new(BoundedQueue::new(16));
        let output = Arc::new(BoundedQueue::new(output_capacity));
        let acks = Arc::new(BoundedQueue::new(ack_capacity));
        let diverse = Arc::new(DiverseSourceCache::new(["200"], Duration::from_secs(30)));
        let stage = PretreatmentStage::new(
            Arc::clone(&input),
            Arc::clone(&output),
            Arc::clone(&acks),
            Arc::new(reference()),
            Arc::clone(&diverse),
        );
        Fixture {
            input,
            output,
            acks,
            diverse,
            stage,
        }
    }

    #[test]
    fn test_canonical_fields_trimmed_and_resolved() {
        let mut report = raw(100, 5, AlarmCategory::Alarm, " A, B ");
        report.severity = Some(9);
        let alarm = canonicalize(&report, &reference()).unwrap();
        assert_eq!(alarm.alarm_id, "100");
        assert_eq!(alarm.external_id, "EXT-100");
        assert_eq!(alarm.managed_object, "Board");
        assert_eq!(alarm.location_info, "A, B");
        assert_eq!(alarm.severity, 2);
        assert_eq!(alarm.cause, "7");
        assert_eq!(alarm.clear_type, ClearType::Active);
    }

    #[test]
    fn test_missing_severity_uses_default() {
        let mut report = raw(200, 5, AlarmCategory::Alarm, "A,B");
        report.severity = None;
        assert_eq!(canonicalize(&report, &reference()).unwrap().severity, 4);
    }

    #[test]
    fn test_clear_forced_to_cleared() {
        let report = raw(100, 5, AlarmCategory::Clear, "A");
        let alarm = canonicalize(&report, &reference()).unwrap();
        assert_eq!(alarm.clear_type, ClearType::Cleared);
    }

    #[test]
    fn test_validation_rules() {
        let data = reference();
        let check = |edit: fn(&mut RawAlarmReport)| {
            let mut report = raw(100, 5, AlarmCategory::Alarm, "A,B");
            edit(&mut report);
            canonicalize(&report, &data).err()
        };

        assert_eq!(check(|r| r.alarm_id = 999), Some(Rejection::UnknownAlarm(999)));
        assert_eq!(check(|r| r.source_port = -1), Some(Rejection::InvalidPort(-1)));
        assert_eq!(check(|r| r.managed_object = " ".into()), Some(Rejection::EmptyManagedObject));
        assert_eq!(check(|r| r.location_info = "".into()), Some(Rejection::EmptyLocation));
        assert_eq!(check(|r| r.resource_id = "".into()), Some(Rejection::EmptyResource));
        assert_eq!(check(|r| r.additional_info = None), Some(Rejection::MissingAdditionalInfo));
        assert_eq!(check(|r| r.source_address = "  ".into()), Some(Rejection::BlankSourceAddress));
        assert_eq!(check(|r| r.category = 7), Some(Rejection::UnknownCategory(7)));
        assert_eq!(check(|_| {}), None);
    }

    #[test]
    fn test_location_count_by_category() {
        let data = reference();
        let alarm_short = raw(300, 1, AlarmCategory::Alarm, "b1,p1");
        assert!(matches!(
            canonicalize(&alarm_short, &data),
            Err(Rejection::LocationCount { actual: 2, defined: 3, .. })
        ));

        let clear_short = raw(300, 2, AlarmCategory::Clear, "b1,p1");
        assert!(canonicalize(&clear_short, &data).is_ok());

        let event_long = raw(300, 3, AlarmCategory::Event, "b1,s1,p1,x");
        assert!(canonicalize(&event_long, &data).is_err());
    }

    #[test]
    fn test_step_forwards_and_acks_rejections() {
        let mut f = fixture(8);
        f.input.offer(raw(100, 5, AlarmCategory::Alarm, "A,B")).unwrap();
        f.input.offer(raw(999, 6, AlarmCategory::Alarm, "A,B")).unwrap();
        f.input.offer(raw(100, 7, AlarmCategory::Clear, "A")).unwrap();

        assert_eq!(f.stage.step().unwrap(), StepOutcome::Processed(3));
        assert!(f.input.is_empty());
        let forwarded: Vec<i64> = f.output.snapshot().iter().map(|a| a.sequence_no).collect();
        assert_eq!(forwarded, vec![5, 7]);
        assert_eq!(f.acks.poll().map(|ack| ack.sequence_no), Some(6));
        assert_eq!(f.stage.step().unwrap(), StepOutcome::Idle);
    }

    #[test]
    fn test_full_output_keeps_report() {
        let mut f = fixture(1);
        f.input.offer(raw(100, 5, AlarmCategory::Alarm, "A,B")).unwrap();
        f.input.offer(raw(100, 6, AlarmCategory::Alarm, "A,C")).unwrap();

        assert_eq!(f.stage.step().unwrap(), StepOutcome::Processed(1));
        assert_eq!(f.input.len(), 1);
        assert_eq!(f.stage.step().unwrap(), StepOutcome::Idle);
        assert_eq!(f.input.peek().map(|r| r.sequence_no), Some(6));

        f.output.poll();
        assert_eq!(f.stage.step().unwrap(), StepOutcome::Processed(1));
        assert!(f.input.is_empty());
    }

    #[test]
    fn test_rejection_waits_for_ack_room() {
        let mut f = fixture_with(8, 1);
        f.input.offer(raw(999, 5, AlarmCategory::Alarm, "A,B")).unwrap();
        f.input.offer(raw(999, 6, AlarmCategory::Alarm, "A,B")).unwrap();

        assert_eq!(f.stage.step().unwrap(), StepOutcome::Processed(1));
        assert_eq!(f.input.peek().map(|r| r.sequence_no), Some(6));

        assert_eq!(f.acks.poll().map(|ack| ack.sequence_no), Some(5));
        assert_eq!(f.stage.step().unwrap(), StepOutcome::Processed(1));
        assert!(f.input.is_empty());
        assert_eq!(f.acks.poll().map(|ack| ack.sequence_no), Some(6));
    }

    #[test]
    fn test_merge_ids_diverted() {
        let mut f = fixture(8);
        f.input.offer(raw(200, 5, AlarmCategory::Alarm, "A,B")).unwrap();
        assert_eq!(f.stage.step().unwrap(), StepOutcome::Processed(1));
        assert!(f.output.is_empty());
        assert!(f.acks.is_empty());
        assert_eq!(f.diverse.held_len(), 1);
    }
}
