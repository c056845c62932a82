//! Range validation and derived-field normalization.
//!
//! Every bounded reading is checked against its configured plausible
//! range; out-of-range values are discarded, never clamped. The river
//! level additionally rejects values equal to the threshold ladder's own
//! constants — the source pages render those as reference lines in the
//! same markup as live readings.

use tracing::debug;

use crate::config::{RangeConfig, StorageCurve, ThresholdConfig};
use crate::extract::FieldSample;
use crate::model::FIELD_RIVER_LEVEL;

/// Validates one raw reading. Returns `None` when the value is outside
/// its plausible range or matches a threshold reference line.
pub fn check(
    field: &str,
    raw: f64,
    ranges: &RangeConfig,
    thresholds: &ThresholdConfig,
) -> Option<f64> {
    if let Some(range) = ranges.for_field(field) {
        if !range.contains(raw) {
            debug!(field, raw, min = range.min, max = range.max, "rejected out-of-range value");
            return None;
        }
    }
    if field == FIELD_RIVER_LEVEL && thresholds.is_reference_value(raw) {
        debug!(field, raw, "rejected threshold reference line");
        return None;
    }
    Some(raw)
}

/// Validates a sample's accepted value; the previous value only survives
/// if it passes the same check, so change derivation never mixes a live
/// reading with a rejected one.
pub fn check_sample(
    field: &str,
    sample: &FieldSample,
    ranges: &RangeConfig,
    thresholds: &ThresholdConfig,
) -> (Option<f64>, Option<f64>) {
    let latest = check(field, sample.latest, ranges, thresholds);
    let previous = sample
        .previous
        .and_then(|v| check(field, v, ranges, thresholds));
    (latest, previous)
}

/// Difference between the accepted and previous values, rounded to two
/// decimals. `None` when either side is missing.
pub fn change(latest: Option<f64>, previous: Option<f64>) -> Option<f64> {
    match (latest, previous) {
        (Some(a), Some(b)) => Some(round2(a - b)),
        _ => None,
    }
}

/// Derives the storage rate from the water level by linear interpolation
/// along the reservoir curve, rounded to one decimal.
pub fn derive_storage_rate(level: f64, curve: &StorageCurve) -> f64 {
    let span = curve.full_level - curve.empty_level;
    round1((level - curve.empty_level) / span * 100.0)
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
