//! Core data types for the Kotogawa monitoring service.
//!
//! This module defines the shared domain model imported by all other modules.
//! It contains no logic and no I/O — only types and the field-key constants
//! used to address individual readings during extraction and validation.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Field keys
// ---------------------------------------------------------------------------

/// Dam reservoir water level, in meters.
pub const FIELD_DAM_LEVEL: &str = "dam_level";

/// Dam storage rate, in percent of capacity.
pub const FIELD_STORAGE_RATE: &str = "storage_rate";

/// Dam inflow, in cubic meters per second.
pub const FIELD_INFLOW: &str = "inflow";

/// Dam outflow (release), in cubic meters per second.
pub const FIELD_OUTFLOW: &str = "outflow";

/// River gauge water level, in meters.
pub const FIELD_RIVER_LEVEL: &str = "river_level";

/// 60-minute rainfall, in millimeters.
pub const FIELD_RAINFALL_HOURLY: &str = "rainfall_hourly";

/// Cumulative rainfall since the event start, in millimeters.
pub const FIELD_RAINFALL_CUMULATIVE: &str = "rainfall_cumulative";

// ---------------------------------------------------------------------------
// Observation record
// ---------------------------------------------------------------------------

/// One complete observation cycle, as persisted to the archive and the
/// latest pointer.
///
/// `timestamp` is the capture instant; `data_time` is the canonical slot the
/// record actually fills. The two differ when the exact-slot row was missing
/// upstream and an adopted row's own timestamp was used instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub data_time: DateTime<FixedOffset>,
    pub dam: DamReadings,
    pub river: RiverReadings,
    pub rainfall: RainfallReadings,
    /// Opaque pass-through block (forecast, precipitation-intensity series)
    /// from the auxiliary endpoint. The core never interprets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<serde_json::Value>,
    /// Structured per-step failures. Empty on a clean cycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepError>,
}

/// Dam reservoir readings. Every field may be absent when the source row
/// was missing or the raw value failed its plausible-range check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DamReadings {
    pub water_level: Option<f64>,
    pub storage_rate: Option<f64>,
    pub inflow: Option<f64>,
    pub outflow: Option<f64>,
    pub storage_change: Option<f64>,
}

/// River gauge readings plus the derived status label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiverReadings {
    pub water_level: Option<f64>,
    pub level_change: Option<f64>,
    /// Label from the threshold table; the missing-data label when
    /// `water_level` is null.
    pub status: String,
}

/// Rainfall gauge readings from the dam source page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RainfallReadings {
    pub hourly: Option<f64>,
    pub cumulative: Option<f64>,
    pub change: Option<f64>,
}

impl ObservationRecord {
    /// Number of populated numeric readings across all blocks.
    ///
    /// The status label and the extended block do not count — a cycle is
    /// only "successful" if at least one actual measurement came through.
    pub fn populated_field_count(&self) -> usize {
        [
            self.dam.water_level,
            self.dam.storage_rate,
            self.dam.inflow,
            self.dam.outflow,
            self.dam.storage_change,
            self.river.water_level,
            self.river.level_change,
            self.rainfall.hourly,
            self.rainfall.cumulative,
            self.rainfall.change,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
    }

    pub fn is_populated(&self) -> bool {
        self.populated_field_count() > 0
    }
}

// ---------------------------------------------------------------------------
// Step failures
// ---------------------------------------------------------------------------

/// Failure taxonomy for a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Fetch failed after exhausting retries.
    Transport,
    /// The document was fetched but no strategy yielded usable fields.
    Extraction,
    /// Raw values were found but all were rejected as implausible.
    Validation,
    /// Writing the record to the archive failed.
    Persistence,
}

/// One recorded step failure, carried on the record that the step could
/// not fully populate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub step: String,
    pub kind: FailureKind,
    pub message: String,
}

impl StepError {
    pub fn new(step: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        StepError {
            step: step.to_string(),
            kind,
            message: message.into(),
        }
    }
}
