//! Alarm records as they move through the pipeline.
//!
//! [`RawAlarmReport`] is what a southbound agent sent; [`CanonicalAlarm`] is the
//! normalized value the correlation engine matches, stores and reports.
//! Canonical alarms are values: an update or a clear produces a new alarm
//! rather than mutating the matched one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-source sequence number ("ack number")
pub type SequenceNo = i64;

/// Lowest severity value accepted from a source
pub const MIN_SEVERITY: i32 = 1;

/// Highest severity value accepted from a source
pub const MAX_SEVERITY: i32 = 6;

/// Identity of a reporting agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub address: String,
    pub port: i32,
}

impl SourceKey {
    pub fn new(address: impl Into<String>, port: i32) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Alarm category as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmCategory {
    /// A fault was raised
    Alarm,
    /// A previously raised fault went away
    Clear,
    /// A one-shot event with no active state
    Event,
}

impl AlarmCategory {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Alarm),
            2 => Some(Self::Clear),
            3 => Some(Self::Event),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Alarm => 1,
            Self::Clear => 2,
            Self::Event => 3,
        }
    }
}

/// Whether a stored alarm is still active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClearType {
    /// DEFAULT: still active
    #[default]
    Active,
    /// NORMAL: cleared
    Cleared,
}

impl ClearType {
    pub fn code(self) -> i32 {
        match self {
            Self::Active => -1,
            Self::Cleared => 0,
        }
    }
}

/// One alarm entry inside an ingress call, before the agent identity is attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEntry {
    pub alarm_id: i64,
    pub sequence_no: SequenceNo,
    pub category: i32,
    pub severity: Option<i32>,
    pub cause: i32,
    pub occur_time: DateTime<Utc>,
    pub managed_object: String,
    pub resource_id: String,
    pub location_info: String,
    pub additional_info: Option<String>,
}

/// One unit received from a source, tagged with the reporting agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAlarmReport {
    pub alarm_id: i64,
    pub sequence_no: SequenceNo,
    pub category: i32,
    pub severity: Option<i32>,
    pub cause: i32,
    pub occur_time: DateTime<Utc>,
    pub managed_object: String,
    pub resource_id: String,
    pub location_info: String,
    pub additional_info: Option<String>,
    pub source_address: String,
    pub source_port: i32,
}

impl RawAlarmReport {
    pub fn from_entry(address: &str, port: i32, entry: AlarmEntry) -> Self {
        Self {
            alarm_id: entry.alarm_id,
            sequence_no: entry.sequence_no,
            category: entry.category,
            severity: entry.severity,
            cause: entry.cause,
            occur_time: entry.occur_time,
            managed_object: entry.managed_object,
            resource_id: entry.resource_id,
            location_info: entry.location_info,
            additional_info: entry.additional_info,
            source_address: address.to_string(),
            source_port: port,
        }
    }

    pub fn category(&self) -> Option<AlarmCategory> {
        AlarmCategory::from_code(self.category)
    }

    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(self.source_address.clone(), self.source_port)
    }

    pub fn ack(&self) -> AckRecord {
        AckRecord {
            address: self.source_address.clone(),
            port: self.source_port,
            sequence_no: self.sequence_no,
        }
    }
}

/// Acknowledgment routed back to the originating agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckRecord {
    pub address: String,
    pub port: i32,
    pub sequence_no: SequenceNo,
}

impl AckRecord {
    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(self.address.clone(), self.port)
    }
}

/// Fields that identify "the same fault" across reports
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmKey {
    pub alarm_id: String,
    pub location_info: String,
    pub managed_object: String,
    pub resource_id: String,
}

/// Normalized alarm held by the correlation engine and the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalAlarm {
    pub alarm_id: String,
    pub external_id: String,
    pub sequence_no: SequenceNo,
    pub category: AlarmCategory,
    pub severity: i32,
    pub cause: String,
    pub occur_time: DateTime<Utc>,
    pub managed_object: String,
    pub resource_id: String,
    pub location_info: String,
    pub additional_info: String,
    pub source: SourceKey,
    pub display_suppressed: bool,
    pub clear_type: ClearType,
    pub serial_no: i64,
    pub sync_no: i64,
    pub clear_time: Option<DateTime<Utc>>,
}

impl CanonicalAlarm {
    pub fn key(&self) -> AlarmKey {
        AlarmKey {
            alarm_id: self.alarm_id.clone(),
            location_info: self.location_info.clone(),
            managed_object: self.managed_object.clone(),
            resource_id: self.resource_id.clone(),
        }
    }

    pub fn has_key(&self, key: &AlarmKey) -> bool {
        self.alarm_id == key.alarm_id
            && self.location_info == key.location_info
            && self.managed_object == key.managed_object
            && self.resource_id == key.resource_id
    }

    /// Identifier, location, managed object and resource all equal
    pub fn same_key(&self, other: &CanonicalAlarm) -> bool {
        self.alarm_id == other.alarm_id
            && self.location_info == other.location_info
            && self.managed_object == other.managed_object
            && self.resource_id == other.resource_id
    }

    pub fn is_active(&self) -> bool {
        self.clear_type == ClearType::Active
    }

    /// `self` is an active record with the same key as `incoming`
    pub fn matches_active(&self, incoming: &CanonicalAlarm) -> bool {
        self.is_active() && self.same_key(incoming)
    }

    /// Duplicate test used before deciding between "discard" and "update".
    ///
    /// With update support the trimmed additional info must also agree; without
    /// it, key and severity alone decide.
    pub fn is_duplicate_of(&self, other: &CanonicalAlarm, update_support: bool) -> bool {
        let coarse = self.same_key(other) && self.severity == other.severity;
        if !update_support {
            return coarse;
        }
        coarse && self.additional_info.trim() == other.additional_info.trim()
    }

    pub fn ack(&self) -> AckRecord {
        AckRecord {
            address: self.source.address.clone(),
            port: self.source.port,
            sequence_no: self.sequence_no,
        }
    }

    pub fn with_numbers(mut self, serial_no: i64, sync_no: i64) -> Self {
        self.serial_no = serial_no;
        self.sync_no = sync_no;
        self
    }

    pub fn with_display_suppressed(mut self, suppressed: bool) -> Self {
        self.display_suppressed = suppressed;
        self
    }

    /// New value of `self` after `incoming` reported a changed severity or
    /// additional info. Stored identity (serial, sync) is kept.
    pub fn updated_with(&self, incoming: &CanonicalAlarm) -> CanonicalAlarm {
        CanonicalAlarm {
            sequence_no: incoming.sequence_no,
            severity: incoming.severity,
            cause: incoming.cause.clone(),
            occur_time: incoming.occur_time,
            additional_info: incoming.additional_info.clone(),
            source: incoming.source.clone(),
            display_suppressed: incoming.display_suppressed,
            ..self.clone()
        }
    }

    /// New value of `self` marked as cleared at `at`
    pub fn cleared_at(&self, at: DateTime<Utc>) -> CanonicalAlarm {
        CanonicalAlarm {
            clear_type: ClearType::Cleared,
            clear_time: Some(at),
            ..self.clone()
        }
    }

    /// History record for this clear report against the active alarm it cleared
    pub fn clear_record_for(&self, target: &CanonicalAlarm) -> CanonicalAlarm {
        CanonicalAlarm {
            severity: target.severity,
            external_id: target.external_id.clone(),
            display_suppressed: target.display_suppressed,
            serial_no: target.serial_no,
            sync_no: target.sync_no,
            clear_type: ClearType::Cleared,
            clear_time: Some(self.occur_time),
            ..self.clone()
        }
    }
}
