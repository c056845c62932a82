//! Collection cycle orchestration.
//!
//! One cycle is a single-threaded, run-to-completion batch: dam+rainfall
//! fetch, river fetch, auxiliary fetch, executed sequentially. Each step
//! is isolated — its failure becomes a structured entry on the record
//! with that step's fields null, never an abort. A cycle is successful
//! when at least one numeric field across all steps was populated;
//! otherwise only an error record is written and the latest pointer
//! keeps the last known-good snapshot.

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use tracing::{error, info, warn};

use crate::alert::staleness;
use crate::alert::thresholds::{self, DamAlert};
use crate::archive::{Archive, ArchiveError};
use crate::config::Config;
use crate::extract::{self, Document, FieldCandidates, TableLayout};
use crate::fetch::DocumentSource;
use crate::model::{
    DamReadings, FailureKind, ObservationRecord, RainfallReadings, RiverReadings, StepError,
    FIELD_DAM_LEVEL, FIELD_INFLOW, FIELD_OUTFLOW, FIELD_RAINFALL_CUMULATIVE,
    FIELD_RAINFALL_HOURLY, FIELD_RIVER_LEVEL, FIELD_STORAGE_RATE,
};
use crate::reconcile::{self, Slot};
use crate::validate;

const STEP_DAM: &str = "dam_rainfall";
const STEP_RIVER: &str = "river";
const STEP_AUXILIARY: &str = "auxiliary";

/// How the cycle's output reached disk.
#[derive(Debug)]
pub enum CyclePersistence {
    Observation(PathBuf),
    ErrorRecord(PathBuf),
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub record: ObservationRecord,
    pub persistence: CyclePersistence,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    source: &'a dyn DocumentSource,
    archive: &'a Archive,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, source: &'a dyn DocumentSource, archive: &'a Archive) -> Self {
        Pipeline {
            config,
            source,
            archive,
        }
    }

    /// Runs one collection cycle for the slot floored from `now`.
    pub fn run_cycle(&self, now: DateTime<FixedOffset>) -> Result<CycleOutcome, ArchiveError> {
        let slot = Slot::floor(now, self.config.polling.interval_minutes);
        info!(slot = %slot.obsdt(), "starting collection cycle");

        let mut errors = Vec::new();
        let (dam, rainfall, dam_time) = self.dam_step(&slot, &mut errors);
        let (river, river_time) = self.river_step(&slot, &mut errors);
        let extended = self.auxiliary_step(&mut errors);

        let data_time = reconcile::resolve_data_time(&slot, dam_time, river_time);
        let mut record = ObservationRecord {
            timestamp: now,
            data_time,
            dam,
            river,
            rainfall,
            extended,
            errors,
        };

        if record.is_populated() {
            self.escalate_dam_alert(&record);
            match self.persist_success(&record) {
                Ok(path) => {
                    info!(
                        data_time = %record.data_time,
                        fields = record.populated_field_count(),
                        step_errors = record.errors.len(),
                        "cycle persisted"
                    );
                    Ok(CycleOutcome {
                        record,
                        persistence: CyclePersistence::Observation(path),
                    })
                }
                Err(e) => {
                    // Never drop data silently: the error-record path is
                    // attempted even when slot persistence failed.
                    error!(error = %e, "observation persistence failed");
                    record
                        .errors
                        .push(StepError::new("persist", FailureKind::Persistence, e.to_string()));
                    if let Err(e2) = self.archive.write_error(&record) {
                        error!(error = %e2, "error-record fallback also failed");
                    }
                    Err(e)
                }
            }
        } else {
            error!(
                step_errors = record.errors.len(),
                "cycle produced no data, writing error record only"
            );
            self.warn_if_latest_stale(now);
            let path = self.archive.write_error(&record)?;
            Ok(CycleOutcome {
                record,
                persistence: CyclePersistence::ErrorRecord(path),
            })
        }
    }

    fn persist_success(&self, record: &ObservationRecord) -> Result<PathBuf, ArchiveError> {
        let path = self.archive.write_observation(record)?;
        self.archive.write_latest(record)?;
        Ok(path)
    }

    // -- steps --------------------------------------------------------------

    fn dam_step(
        &self,
        slot: &Slot,
        errors: &mut Vec<StepError>,
    ) -> (DamReadings, RainfallReadings, Option<NaiveDateTime>) {
        let empty = (DamReadings::default(), RainfallReadings::default(), None);
        let Some(candidates) =
            self.station_candidates(STEP_DAM, &self.config.sources.dam, slot, errors)
        else {
            return empty;
        };

        let (water_level, previous_level) = self.validated(&candidates, FIELD_DAM_LEVEL);
        let (mut storage_rate, _) = self.validated(&candidates, FIELD_STORAGE_RATE);
        if storage_rate.is_none() {
            if let Some(level) = water_level {
                let derived = validate::derive_storage_rate(level, &self.config.storage_curve);
                storage_rate = validate::check(
                    FIELD_STORAGE_RATE,
                    derived,
                    &self.config.ranges,
                    &self.config.thresholds,
                );
            }
        }
        let (inflow, _) = self.validated(&candidates, FIELD_INFLOW);
        let (outflow, _) = self.validated(&candidates, FIELD_OUTFLOW);
        let (hourly, _) = self.validated(&candidates, FIELD_RAINFALL_HOURLY);
        let (cumulative, previous_cumulative) =
            self.validated(&candidates, FIELD_RAINFALL_CUMULATIVE);

        let dam = DamReadings {
            water_level,
            storage_rate,
            inflow,
            outflow,
            storage_change: validate::change(water_level, previous_level),
        };
        let rainfall = RainfallReadings {
            hourly,
            cumulative,
            change: validate::change(cumulative, previous_cumulative),
        };

        if dam == DamReadings::default() && rainfall == RainfallReadings::default() {
            errors.push(StepError::new(
                STEP_DAM,
                FailureKind::Validation,
                "every raw value was rejected as implausible",
            ));
            return empty;
        }
        (dam, rainfall, candidates.row_time)
    }

    fn river_step(
        &self,
        slot: &Slot,
        errors: &mut Vec<StepError>,
    ) -> (RiverReadings, Option<NaiveDateTime>) {
        let missing = RiverReadings {
            water_level: None,
            level_change: None,
            status: self.config.thresholds.missing_label.clone(),
        };
        let Some(candidates) =
            self.station_candidates(STEP_RIVER, &self.config.sources.river, slot, errors)
        else {
            return (missing, None);
        };

        let (water_level, previous) = self.validated(&candidates, FIELD_RIVER_LEVEL);
        if water_level.is_none() {
            errors.push(StepError::new(
                STEP_RIVER,
                FailureKind::Validation,
                "every raw value was rejected as implausible",
            ));
            return (missing, None);
        }
        let river = RiverReadings {
            water_level,
            level_change: validate::change(water_level, previous),
            status: thresholds::classify_river_level(water_level, &self.config.thresholds),
        };
        (river, candidates.row_time)
    }

    /// Fetches the optional forecast endpoint; the body is carried
    /// opaquely on the record.
    fn auxiliary_step(&self, errors: &mut Vec<StepError>) -> Option<serde_json::Value> {
        let url = self.config.sources.auxiliary_url.as_ref()?;
        match self.source.fetch_url(url) {
            Ok(body) => Some(
                serde_json::from_str(&body).unwrap_or_else(|_| serde_json::Value::String(body)),
            ),
            Err(e) => {
                warn!(step = STEP_AUXILIARY, error = %e, "auxiliary fetch failed");
                errors.push(StepError::new(
                    STEP_AUXILIARY,
                    FailureKind::Transport,
                    e.to_string(),
                ));
                None
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn station_candidates(
        &self,
        step: &str,
        source: &crate::config::SourceConfig,
        slot: &Slot,
        errors: &mut Vec<StepError>,
    ) -> Option<FieldCandidates> {
        let body = match self.source.fetch_station(source, slot) {
            Ok(body) => body,
            Err(e) => {
                error!(step, error = %e, "fetch failed after retries");
                errors.push(StepError::new(step, FailureKind::Transport, e.to_string()));
                return None;
            }
        };
        let doc = match Document::parse(&body) {
            Ok(doc) => doc,
            Err(e) => {
                error!(step, error = %e, "document parse failed");
                errors.push(StepError::new(step, FailureKind::Extraction, e.to_string()));
                return None;
            }
        };
        let candidates = self.extract_from(&doc, &source.layout, slot);
        if candidates.is_none() {
            warn!(step, "no extraction strategy yielded fields");
            errors.push(StepError::new(
                step,
                FailureKind::Extraction,
                "no extraction strategy yielded fields",
            ));
        }
        candidates
    }

    fn extract_from(
        &self,
        doc: &Document,
        layout: &TableLayout,
        slot: &Slot,
    ) -> Option<FieldCandidates> {
        let archived = |t: NaiveDateTime| self.archive.has_slot(t);
        let in_range = |field: &str, value: f64| {
            validate::check(field, value, &self.config.ranges, &self.config.thresholds).is_some()
        };
        extract::extract(doc, layout, slot, &archived, &in_range)
    }

    fn validated(&self, candidates: &FieldCandidates, field: &str) -> (Option<f64>, Option<f64>) {
        match candidates.values.get(field) {
            Some(sample) => validate::check_sample(
                field,
                sample,
                &self.config.ranges,
                &self.config.thresholds,
            ),
            None => (None, None),
        }
    }

    fn escalate_dam_alert(&self, record: &ObservationRecord) {
        if let Some(level) = record.dam.water_level {
            match thresholds::classify_dam_level(level, &self.config.thresholds) {
                DamAlert::Danger => error!(level, "dam level at danger threshold"),
                DamAlert::Warning => warn!(level, "dam level at warning threshold"),
                DamAlert::Normal => {}
            }
        }
    }

    fn warn_if_latest_stale(&self, now: DateTime<FixedOffset>) {
        if let Ok(Some(previous)) = self.archive.read_latest() {
            let max_age = self.config.polling.max_data_age_minutes;
            if staleness::is_stale_at(previous.data_time, max_age, now) {
                warn!(
                    data_time = %previous.data_time,
                    max_age_minutes = max_age,
                    "latest pointer is stale"
                );
            }
        }
    }
}
