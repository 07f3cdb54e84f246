//! Location-parameter aware alarm matching.
//!
//! Location info is a comma-separated list of parameters. The alarm's
//! location schema marks which positions identify the fault; only those are
//! compared. A report whose parameter count differs from the schema (a clear
//! that carries only its key parameters, say) is walked with the candidate's
//! index skipping non-key positions while its own index stays put.

use crate::model::CanonicalAlarm;
use crate::reference::LocationParam;
use tracing::debug;

/// Split location info into trimmed parameters; blank input has none
pub fn split_params(location: &str) -> Vec<&str> {
    if location.trim().is_empty() {
        return Vec::new();
    }
    location.split(',').map(str::trim).collect()
}

/// How an alarm is compared to candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchMode {
    /// Whole location field must be equal
    WholeField,
    /// Compare the marked key positions of the schema
    KeyPositions(Vec<bool>),
}

/// Pick the comparison for an alarm with `location` under `schema`.
///
/// Falls back to whole-field comparison when the location is blank, the
/// schema is missing or empty, the schema marks no key or only keys, or the
/// location has fewer parameters than the schema has keys.
pub fn match_mode(location: &str, schema: Option<&[LocationParam]>) -> MatchMode {
    let schema = match schema {
        Some(schema) if !schema.is_empty() => schema,
        _ => return MatchMode::WholeField,
    };
    if location.trim().is_empty() {
        return MatchMode::WholeField;
    }

    let keys: Vec<bool> = schema.iter().map(|param| param.is_matching_key).collect();
    let key_count = keys.iter().filter(|key| **key).count();
    if key_count == 0 || key_count == keys.len() {
        return MatchMode::WholeField;
    }
    if split_params(location).len() < key_count {
        debug!(location, key_count, "fewer parameters than keys, matching whole field");
        return MatchMode::WholeField;
    }
    MatchMode::KeyPositions(keys)
}

/// True if every key position of `current` equals the candidate's
pub fn keys_agree(current: &str, candidate: &str, keys: &[bool]) -> bool {
    let current = split_params(current);
    let candidate = split_params(candidate);
    let walk_together = current.len() == keys.len();

    let mut cur_idx = 0;
    let mut cand_idx = 0;
    let mut matched = false;
    for &is_key in keys {
        if !is_key {
            cand_idx += 1;
            if walk_together {
                cur_idx += 1;
            }
            continue;
        }

        match (current.get(cur_idx), candidate.get(cand_idx)) {
            (Some(a), Some(b)) if a == b => matched = true,
            _ => return false,
        }
        cur_idx += 1;
        cand_idx += 1;
    }
    matched
}

/// `candidate` has the same identifier as `current` and its location agrees
/// under `mode`
pub fn is_match(current: &CanonicalAlarm, candidate: &CanonicalAlarm, mode: &MatchMode) -> bool {
    candidate.alarm_id == current.alarm_id
        && match mode {
            MatchMode::WholeField => candidate.same_key(current),
            MatchMode::KeyPositions(keys) => {
                keys_agree(&current.location_info, &candidate.location_info, keys)
            }
        }
}

/// Index of the first candidate matching `current` under `mode`
pub fn find_match(current: &CanonicalAlarm, candidates: &[CanonicalAlarm], mode: &MatchMode) -> Option<usize> {
    candidates
        .iter()
        .position(|candidate| is_match(current, candidate, mode))
}
