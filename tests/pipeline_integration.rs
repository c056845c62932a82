//! Full-cycle pipeline tests against scripted documents.
//!
//! These run the real extraction/validation/reconciliation/persistence
//! path end to end with a scripted `DocumentSource` and a tempdir
//! archive root — no network, no real clock.

use chrono::{DateTime, FixedOffset, TimeZone};
use serde_json::json;
use tempfile::TempDir;

use kotomon_service::archive::Archive;
use kotomon_service::config::{Config, SourceConfig};
use kotomon_service::fetch::{DocumentSource, FetchError};
use kotomon_service::model::{FailureKind, ObservationRecord};
use kotomon_service::pipeline::{CyclePersistence, Pipeline};
use kotomon_service::reconcile::Slot;

// ---------------------------------------------------------------------------
// Scripted source
// ---------------------------------------------------------------------------

struct ScriptedSource {
    dam: Result<String, FetchError>,
    river: Result<String, FetchError>,
    auxiliary: Result<String, FetchError>,
}

impl ScriptedSource {
    fn new(dam: Result<String, FetchError>, river: Result<String, FetchError>) -> Self {
        ScriptedSource {
            dam,
            river,
            auxiliary: Err(FetchError::Transport("no auxiliary scripted".to_string())),
        }
    }
}

impl DocumentSource for ScriptedSource {
    fn fetch_station(&self, source: &SourceConfig, _slot: &Slot) -> Result<String, FetchError> {
        if source.station_code == "015" {
            self.dam.clone()
        } else {
            self.river.clone()
        }
    }

    fn fetch_url(&self, _url: &str) -> Result<String, FetchError> {
        self.auxiliary.clone()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Dam page publishing through the 14:00 slot, rainfall columns included.
const DAM_PAGE: &str = r#"<html><body>
    <table>
      <tr><th>日付</th><th>時刻</th><th>貯水位</th><th>貯水率</th><th>流入量</th><th>放流量</th><th>60分雨量</th><th>累積雨量</th></tr>
      <tr><td>2025/06/22</td><td>13:50</td><td>36.72</td><td>96.8</td><td>7.10</td><td>9.40</td><td>0</td><td>1</td></tr>
      <tr><td>2025/06/22</td><td>14:00</td><td>36.74</td><td>97.0</td><td>7.31</td><td>9.41</td><td>1</td><td>2</td></tr>
    </table>
</body></html>"#;

/// Dam page lagging one slot behind the observation clock.
const DAM_PAGE_LAGGING: &str = r#"<html><body>
    <table>
      <tr><th>日付</th><th>時刻</th><th>貯水位</th><th>貯水率</th><th>流入量</th><th>放流量</th><th>60分雨量</th><th>累積雨量</th></tr>
      <tr><td>2025/06/22</td><td>13:40</td><td>36.70</td><td>96.6</td><td>7.00</td><td>9.38</td><td>0</td><td>1</td></tr>
      <tr><td>2025/06/22</td><td>13:50</td><td>36.72</td><td>96.8</td><td>7.10</td><td>9.40</td><td>0</td><td>1</td></tr>
    </table>
</body></html>"#;

/// Dam page whose storage-rate column is a gap marker.
const DAM_PAGE_NO_RATE: &str = r#"<html><body>
    <table>
      <tr><th>日付</th><th>時刻</th><th>貯水位</th><th>貯水率</th><th>流入量</th><th>放流量</th><th>60分雨量</th><th>累積雨量</th></tr>
      <tr><td>2025/06/22</td><td>14:00</td><td>36.74</td><td>欠測</td><td>7.31</td><td>9.41</td><td>1</td><td>2</td></tr>
    </table>
</body></html>"#;

const RIVER_PAGE: &str = r#"<html><body>
    <table>
      <tr><th>日付</th><th>時刻</th><th>水位</th></tr>
      <tr><td>2025/06/22</td><td>13:50</td><td>2.83</td></tr>
      <tr><td>2025/06/22</td><td>14:00</td><td>2.85</td></tr>
    </table>
</body></html>"#;

fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

/// Capture instant 14:07 — targets the 14:00 slot with the default
/// 10-minute interval.
fn now_1407() -> DateTime<FixedOffset> {
    jst().with_ymd_and_hms(2025, 6, 22, 14, 7, 0).unwrap()
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config
}

fn transport_failure() -> Result<String, FetchError> {
    Err(FetchError::Transport("connection refused".to_string()))
}

// ---------------------------------------------------------------------------
// Successful cycles
// ---------------------------------------------------------------------------

#[test]
fn test_full_cycle_persists_exact_slot_observation() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);
    let source = ScriptedSource::new(Ok(DAM_PAGE.to_string()), Ok(RIVER_PAGE.to_string()));

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .expect("cycle should persist");

    let record = &outcome.record;
    assert_eq!(record.dam.water_level, Some(36.74));
    assert_eq!(record.dam.storage_rate, Some(97.0));
    assert_eq!(record.dam.inflow, Some(7.31));
    assert_eq!(record.dam.outflow, Some(9.41));
    assert_eq!(record.dam.storage_change, Some(0.02));
    assert_eq!(record.river.water_level, Some(2.85));
    assert_eq!(record.river.level_change, Some(0.02));
    assert_eq!(record.river.status, "正常");
    assert_eq!(record.rainfall.hourly, Some(1.0));
    assert_eq!(record.rainfall.cumulative, Some(2.0));
    assert_eq!(record.rainfall.change, Some(1.0));
    assert!(record.errors.is_empty(), "a clean cycle records no step errors");

    assert_eq!(
        serde_json::to_string(&record.data_time).unwrap(),
        "\"2025-06-22T14:00:00+09:00\""
    );

    assert!(matches!(outcome.persistence, CyclePersistence::Observation(_)));
    assert!(dir.path().join("history/2025/06/22/1400.json").exists());
    let latest = archive.read_latest().unwrap().expect("latest pointer written");
    assert_eq!(&latest, record);
}

#[test]
fn test_river_level_between_thresholds_classifies_one_tier_down() {
    let river_page = r#"<html><body><table>
      <tr><th>日付</th><th>時刻</th><th>水位</th></tr>
      <tr><td>2025/06/22</td><td>13:50</td><td>4.90</td></tr>
      <tr><td>2025/06/22</td><td>14:00</td><td>5.05</td></tr>
    </table></body></html>"#;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);
    let source = ScriptedSource::new(Ok(DAM_PAGE.to_string()), Ok(river_page.to_string()));

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .unwrap();

    // 5.05 meets 氾濫注意 (5.00) but not 避難判断 (5.10).
    assert_eq!(outcome.record.river.water_level, Some(5.05));
    assert_eq!(outcome.record.river.status, "氾濫注意");
}

#[test]
fn test_storage_rate_derived_from_level_when_column_missing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);
    let source = ScriptedSource::new(Ok(DAM_PAGE_NO_RATE.to_string()), transport_failure());

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .unwrap();

    // Linear interpolation between the 20 m empty and 40 m full levels.
    assert_eq!(outcome.record.dam.water_level, Some(36.74));
    assert_eq!(outcome.record.dam.storage_rate, Some(83.7));
}

#[test]
fn test_rerun_of_same_slot_overwrites_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);

    let first = ScriptedSource::new(Ok(DAM_PAGE.to_string()), Ok(RIVER_PAGE.to_string()));
    Pipeline::new(&config, &first, &archive).run_cycle(now_1407()).unwrap();

    let revised = DAM_PAGE.replace("36.74", "36.80");
    let second = ScriptedSource::new(Ok(revised), Ok(RIVER_PAGE.to_string()));
    Pipeline::new(&config, &second, &archive).run_cycle(now_1407()).unwrap();

    let day = archive
        .read_day(chrono::NaiveDate::from_ymd_opt(2025, 6, 22).unwrap())
        .unwrap();
    assert_eq!(day.observations.len(), 1, "re-persisting a slot must not duplicate it");
    assert_eq!(day.observations[0].dam.water_level, Some(36.80));
}

#[test]
fn test_auxiliary_payload_is_opaque_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sources.auxiliary_url = Some("https://example.invalid/forecast.json".to_string());
    let archive = Archive::new(&config.data_dir);
    let mut source = ScriptedSource::new(Ok(DAM_PAGE.to_string()), Ok(RIVER_PAGE.to_string()));
    source.auxiliary = Ok(r#"{"forecast": [0, 2, 5]}"#.to_string());

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .unwrap();

    assert_eq!(outcome.record.extended, Some(json!({"forecast": [0, 2, 5]})));
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[test]
fn test_lagging_source_adopts_row_timestamp_as_data_time() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);
    let source = ScriptedSource::new(Ok(DAM_PAGE_LAGGING.to_string()), transport_failure());

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .unwrap();

    // The 14:00 row was absent upstream; the adopted 13:50 row's own
    // timestamp becomes the record's effective data_time.
    assert_eq!(
        outcome.record.data_time,
        jst().with_ymd_and_hms(2025, 6, 22, 13, 50, 0).unwrap()
    );
    assert_eq!(outcome.record.dam.water_level, Some(36.72));
    assert!(dir.path().join("history/2025/06/22/1350.json").exists());
}

#[test]
fn test_later_of_disagreeing_source_timestamps_wins() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);
    // Dam lags at 13:50, river publishes the exact 14:00 slot.
    let source =
        ScriptedSource::new(Ok(DAM_PAGE_LAGGING.to_string()), Ok(RIVER_PAGE.to_string()));

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .unwrap();

    assert_eq!(
        outcome.record.data_time,
        jst().with_ymd_and_hms(2025, 6, 22, 14, 0, 0).unwrap()
    );
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[test]
fn test_river_failure_leaves_dam_and_rainfall_populated() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);
    let source = ScriptedSource::new(Ok(DAM_PAGE.to_string()), transport_failure());

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .expect("partial success still persists");

    let record = &outcome.record;
    assert_eq!(record.dam.water_level, Some(36.74));
    assert_eq!(record.rainfall.hourly, Some(1.0));
    assert_eq!(record.river.water_level, None);
    assert_eq!(record.river.status, "データなし");
    assert!(
        record
            .errors
            .iter()
            .any(|e| e.step == "river" && e.kind == FailureKind::Transport),
        "the river failure must be recorded as a structured step error"
    );
    assert!(matches!(outcome.persistence, CyclePersistence::Observation(_)));
    assert!(archive.read_latest().unwrap().is_some(), "partial data still updates latest");
}

#[test]
fn test_total_failure_writes_error_record_and_preserves_latest() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);

    // Seed a known-good latest pointer from an earlier cycle.
    let good = ScriptedSource::new(Ok(DAM_PAGE.to_string()), Ok(RIVER_PAGE.to_string()));
    Pipeline::new(&config, &good, &archive)
        .run_cycle(jst().with_ymd_and_hms(2025, 6, 22, 14, 2, 0).unwrap())
        .unwrap();
    let known_good: ObservationRecord = archive.read_latest().unwrap().unwrap();

    // Next cycle: every fetch step fails.
    let broken = ScriptedSource::new(transport_failure(), transport_failure());
    let outcome = Pipeline::new(&config, &broken, &archive)
        .run_cycle(jst().with_ymd_and_hms(2025, 6, 22, 14, 17, 0).unwrap())
        .expect("a failed cycle still writes its error record");

    assert!(!outcome.record.is_populated());
    assert!(matches!(outcome.persistence, CyclePersistence::ErrorRecord(_)));
    assert!(
        dir.path().join("history/2025/06/22/error_1410.json").exists(),
        "an error record must appear under the current date"
    );
    assert_eq!(
        archive.read_latest().unwrap().unwrap(),
        known_good,
        "the latest pointer must keep the last known-good snapshot"
    );
}

#[test]
fn test_out_of_range_values_are_nulled_not_clamped() {
    // A corrupted dam page: level far outside the 30-40 m envelope.
    let corrupted = DAM_PAGE
        .replace("36.74", "99.99")
        .replace("36.72", "99.98");
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let archive = Archive::new(&config.data_dir);
    let source = ScriptedSource::new(Ok(corrupted), Ok(RIVER_PAGE.to_string()));

    let outcome = Pipeline::new(&config, &source, &archive)
        .run_cycle(now_1407())
        .unwrap();

    assert_eq!(outcome.record.dam.water_level, None);
    assert_eq!(outcome.record.dam.storage_change, None);
    // The river step is unaffected by the dam source's corruption.
    assert_eq!(outcome.record.river.water_level, Some(2.85));
}
