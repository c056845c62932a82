//! Daily rollup aggregation.
//!
//! Once per cycle the previous calendar day is summarized into one
//! `daily_summary.json`: min/max/mean per series, the day's maximum
//! cumulative rainfall, and dam flow readings integrated over the slot
//! width. A summary is immutable once written — a second run for the
//! same day is an idempotent skip. Error records count toward
//! `error_count` but contribute no numeric statistics.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::{Archive, ArchiveError};
use crate::model::ObservationRecord;

/// Min/max/mean over one day's series of readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl SeriesStats {
    fn from_values(values: &[f64]) -> Option<SeriesStats> {
        if values.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        Some(SeriesStats {
            min,
            max,
            mean: sum / values.len() as f64,
        })
    }
}

/// One day's aggregated statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub generated_at: DateTime<FixedOffset>,
    pub sample_count: usize,
    pub error_count: usize,
    pub dam_water_level: Option<SeriesStats>,
    pub dam_storage_rate: Option<SeriesStats>,
    pub river_water_level: Option<SeriesStats>,
    pub rainfall_hourly: Option<SeriesStats>,
    /// Maximum cumulative gauge reading of the day, in millimeters.
    pub rainfall_total_mm: Option<f64>,
    /// Inflow readings (m³/s) integrated over the slot width.
    pub inflow_total_m3: Option<f64>,
    /// Outflow readings (m³/s) integrated over the slot width.
    pub outflow_total_m3: Option<f64>,
}

#[derive(Debug, PartialEq)]
pub enum RollupOutcome {
    Written,
    AlreadyExists,
    NoData,
}

/// Summarizes one archive day. Skipped when a summary already exists or
/// the day holds no entries at all.
pub fn summarize(
    archive: &Archive,
    date: NaiveDate,
    interval_minutes: u32,
    now: DateTime<FixedOffset>,
) -> Result<RollupOutcome, ArchiveError> {
    if archive.summary_path(date).exists() {
        return Ok(RollupOutcome::AlreadyExists);
    }
    let day = archive.read_day(date)?;
    if day.observations.is_empty() && day.error_count == 0 {
        return Ok(RollupOutcome::NoData);
    }

    let summary = build_summary(date, &day.observations, day.error_count, interval_minutes, now);
    archive.write_summary(date, &summary)?;
    info!(
        %date,
        samples = summary.sample_count,
        errors = summary.error_count,
        "wrote daily summary"
    );
    Ok(RollupOutcome::Written)
}

fn build_summary(
    date: NaiveDate,
    observations: &[ObservationRecord],
    error_count: usize,
    interval_minutes: u32,
    now: DateTime<FixedOffset>,
) -> DailySummary {
    let slot_secs = f64::from(interval_minutes) * 60.0;
    let collect = |f: &dyn Fn(&ObservationRecord) -> Option<f64>| -> Vec<f64> {
        observations.iter().filter_map(|r| f(r)).collect()
    };

    let inflows = collect(&|r| r.dam.inflow);
    let outflows = collect(&|r| r.dam.outflow);
    let cumulative = collect(&|r| r.rainfall.cumulative);

    DailySummary {
        date,
        generated_at: now,
        sample_count: observations.len(),
        error_count,
        dam_water_level: SeriesStats::from_values(&collect(&|r| r.dam.water_level)),
        dam_storage_rate: SeriesStats::from_values(&collect(&|r| r.dam.storage_rate)),
        river_water_level: SeriesStats::from_values(&collect(&|r| r.river.water_level)),
        rainfall_hourly: SeriesStats::from_values(&collect(&|r| r.rainfall.hourly)),
        rainfall_total_mm: cumulative.into_iter().reduce(f64::max),
        inflow_total_m3: total_flow(&inflows, slot_secs),
        outflow_total_m3: total_flow(&outflows, slot_secs),
    }
}

/// Flow readings in m³/s integrated as one slot width each.
fn total_flow(readings: &[f64], slot_secs: f64) -> Option<f64> {
    if readings.is_empty() {
        None
    } else {
        Some(readings.iter().sum::<f64>() * slot_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DamReadings, RainfallReadings, RiverReadings, StepError, FailureKind};
    use chrono::TimeZone;

    fn jst_now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 23, 0, 10, 0)
            .unwrap()
    }

    fn record(h: u32, m: u32, level: f64, inflow: f64, cumulative: f64) -> ObservationRecord {
        let t = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 22, h, m, 0)
            .unwrap();
        ObservationRecord {
            timestamp: t,
            data_time: t,
            dam: DamReadings {
                water_level: Some(level),
                storage_rate: Some(97.0),
                inflow: Some(inflow),
                outflow: Some(inflow + 1.0),
                storage_change: None,
            },
            river: RiverReadings {
                water_level: Some(2.85),
                level_change: None,
                status: "正常".to_string(),
            },
            rainfall: RainfallReadings {
                hourly: Some(1.0),
                cumulative: Some(cumulative),
                change: None,
            },
            extended: None,
            errors: Vec::new(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 22).unwrap()
    }

    #[test]
    fn test_summary_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        archive.write_observation(&record(14, 0, 36.70, 7.0, 2.0)).unwrap();
        archive.write_observation(&record(14, 10, 36.74, 8.0, 3.0)).unwrap();
        archive.write_observation(&record(14, 20, 36.72, 9.0, 5.0)).unwrap();

        let outcome = summarize(&archive, day(), 10, jst_now()).unwrap();
        assert_eq!(outcome, RollupOutcome::Written);

        let summary: DailySummary = archive.read_summary(day()).unwrap().unwrap();
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.error_count, 0);
        let levels = summary.dam_water_level.unwrap();
        assert_eq!(levels.min, 36.70);
        assert_eq!(levels.max, 36.74);
        assert!((levels.mean - 36.72).abs() < 1e-9);
        assert_eq!(summary.rainfall_total_mm, Some(5.0));
        // (7 + 8 + 9) m³/s over 600-second slots.
        assert_eq!(summary.inflow_total_m3, Some(24.0 * 600.0));
    }

    #[test]
    fn test_error_records_counted_but_excluded_from_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        archive.write_observation(&record(14, 0, 36.70, 7.0, 2.0)).unwrap();

        let mut failed = record(14, 10, 0.0, 0.0, 0.0);
        failed.dam = DamReadings::default();
        failed.river = RiverReadings::default();
        failed.rainfall = RainfallReadings::default();
        failed.errors.push(StepError::new(
            "dam_rainfall",
            FailureKind::Transport,
            "HTTP status 503",
        ));
        archive.write_error(&failed).unwrap();

        summarize(&archive, day(), 10, jst_now()).unwrap();
        let summary: DailySummary = archive.read_summary(day()).unwrap().unwrap();
        assert_eq!(summary.sample_count, 1);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.dam_water_level.unwrap().max, 36.70);
    }

    #[test]
    fn test_existing_summary_is_an_idempotent_skip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        archive.write_observation(&record(14, 0, 36.70, 7.0, 2.0)).unwrap();

        assert_eq!(summarize(&archive, day(), 10, jst_now()).unwrap(), RollupOutcome::Written);
        let first = std::fs::read(archive.summary_path(day())).unwrap();

        // A later observation must not change an already-written summary.
        archive.write_observation(&record(14, 10, 36.90, 9.0, 8.0)).unwrap();
        assert_eq!(
            summarize(&archive, day(), 10, jst_now()).unwrap(),
            RollupOutcome::AlreadyExists
        );
        let second = std::fs::read(archive.summary_path(day())).unwrap();
        assert_eq!(first, second, "summaries are immutable once present");
    }

    #[test]
    fn test_empty_day_produces_no_summary() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        assert_eq!(summarize(&archive, day(), 10, jst_now()).unwrap(), RollupOutcome::NoData);
        assert!(!archive.summary_path(day()).exists());
    }

    #[test]
    fn test_all_null_series_yields_no_stats() {
        let values: Vec<f64> = Vec::new();
        assert_eq!(SeriesStats::from_values(&values), None);
    }
}
