//! Date-partitioned JSON archive.
//!
//! Layout under the configured data directory:
//!
//! ```text
//! latest.json                          sole mutable record
//! history/<YYYY>/<MM>/<DD>/<HHMM>.json one immutable entry per slot
//! history/<YYYY>/<MM>/<DD>/error_<HHMM>.json   failed cycles
//! history/<YYYY>/<MM>/<DD>/daily_summary.json  rollups
//! ```
//!
//! Every write is atomic: serialize into a temp file in the destination
//! directory, then rename over the final path. Re-persisting an occupied
//! slot overwrites it. Retention walks the partition hierarchy and
//! tolerates entries disappearing mid-scan.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::ObservationRecord;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("atomic rename failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Entries found for one archive day.
#[derive(Debug, Default)]
pub struct DayEntries {
    pub observations: Vec<ObservationRecord>,
    pub error_count: usize,
}

/// Counters returned by a retention pass, for logging.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub days_removed: usize,
    pub months_removed: usize,
    pub years_removed: usize,
    pub skipped: usize,
}

pub struct Archive {
    root: PathBuf,
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>) -> Archive {
        Archive { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -- path scheme --------------------------------------------------------

    pub fn latest_path(&self) -> PathBuf {
        self.root.join("latest.json")
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("history")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    pub fn observation_path(&self, data_time: NaiveDateTime) -> PathBuf {
        self.day_dir(data_time.date())
            .join(format!("{:02}{:02}.json", data_time.hour(), data_time.minute()))
    }

    pub fn error_record_path(&self, data_time: NaiveDateTime) -> PathBuf {
        self.day_dir(data_time.date()).join(format!(
            "error_{:02}{:02}.json",
            data_time.hour(),
            data_time.minute()
        ))
    }

    pub fn summary_path(&self, date: NaiveDate) -> PathBuf {
        self.day_dir(date).join("daily_summary.json")
    }

    // -- idempotency key ----------------------------------------------------

    /// Whether the slot already holds a persisted entry. This is the
    /// de-duplication signal consulted by the latest-unseen extraction
    /// strategy.
    pub fn has_slot(&self, data_time: NaiveDateTime) -> bool {
        self.observation_path(data_time).exists()
    }

    // -- writes -------------------------------------------------------------

    /// Persists an observation at its slot path. An occupied slot is
    /// overwritten, never duplicated.
    pub fn write_observation(&self, record: &ObservationRecord) -> Result<PathBuf, ArchiveError> {
        let path = self.observation_path(record.data_time.naive_local());
        if path.exists() {
            debug!(path = %path.display(), "overwriting occupied slot");
        }
        self.write_json(&path, record)?;
        Ok(path)
    }

    /// Overwrites the latest pointer. Only called on cycles that
    /// populated at least one field.
    pub fn write_latest(&self, record: &ObservationRecord) -> Result<(), ArchiveError> {
        self.write_json(&self.latest_path(), record)
    }

    /// Persists an error record for a failed cycle. The latest pointer is
    /// deliberately untouched so consumers keep the last known-good
    /// snapshot.
    pub fn write_error(&self, record: &ObservationRecord) -> Result<PathBuf, ArchiveError> {
        let path = self.error_record_path(record.data_time.naive_local());
        self.write_json(&path, record)?;
        Ok(path)
    }

    pub fn write_summary<T: Serialize>(
        &self,
        date: NaiveDate,
        summary: &T,
    ) -> Result<PathBuf, ArchiveError> {
        let path = self.summary_path(date);
        self.write_json(&path, summary)?;
        Ok(path)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), ArchiveError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    /// The latest pointer, or `None` if absent or unreadable.
    pub fn read_latest(&self) -> Result<Option<ObservationRecord>, ArchiveError> {
        let path = self.latest_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable latest pointer");
                Ok(None)
            }
        }
    }

    /// Every entry for one day, in slot order. Error records are counted
    /// but not parsed; files disappearing mid-scan are tolerated.
    pub fn read_day(&self, date: NaiveDate) -> Result<DayEntries, ArchiveError> {
        let dir = self.day_dir(date);
        let reader = match fs::read_dir(&dir) {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DayEntries::default()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = reader
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        let mut entries = DayEntries::default();
        for name in names {
            if name.starts_with("error_") && name.ends_with(".json") {
                entries.error_count += 1;
                continue;
            }
            if !is_slot_file(&name) {
                continue;
            }
            let path = dir.join(&name);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_str::<ObservationRecord>(&text) {
                Ok(record) => entries.observations.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                }
            }
        }
        Ok(entries)
    }

    pub fn read_summary<T: DeserializeOwned>(
        &self,
        date: NaiveDate,
    ) -> Result<Option<T>, ArchiveError> {
        let text = match fs::read_to_string(self.summary_path(date)) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    // -- retention ----------------------------------------------------------

    /// Deletes day partitions strictly older than `today - horizon_days`,
    /// whole month/year partitions once fully past the horizon, and any
    /// partition directory emptied along the way. Non-date-parseable
    /// names are skipped with a warning, never deleted.
    pub fn prune(&self, horizon_days: u32, today: NaiveDate) -> Result<PruneStats, ArchiveError> {
        let cutoff = today - Duration::days(horizon_days as i64);
        let mut stats = PruneStats::default();
        let history = self.root.join("history");
        let years = match fs::read_dir(&history) {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        for year_entry in years.flatten() {
            let year_path = year_entry.path();
            if !year_path.is_dir() {
                continue;
            }
            let year_name = year_entry.file_name().to_string_lossy().into_owned();
            let Ok(year) = year_name.parse::<i32>() else {
                warn!(name = %year_name, "skipping non-date year partition");
                stats.skipped += 1;
                continue;
            };
            if year < cutoff.year() {
                remove_partition(&year_path);
                stats.years_removed += 1;
                continue;
            }
            self.prune_year(&year_path, year, cutoff, &mut stats);
            if is_empty_dir(&year_path) {
                remove_empty(&year_path);
                stats.years_removed += 1;
            }
        }
        Ok(stats)
    }

    fn prune_year(&self, year_path: &Path, year: i32, cutoff: NaiveDate, stats: &mut PruneStats) {
        let Ok(months) = fs::read_dir(year_path) else {
            return;
        };
        for month_entry in months.flatten() {
            let month_path = month_entry.path();
            if !month_path.is_dir() {
                continue;
            }
            let month_name = month_entry.file_name().to_string_lossy().into_owned();
            let Some(month) = month_name.parse::<u32>().ok().filter(|m| (1..=12).contains(m))
            else {
                warn!(name = %month_name, "skipping non-date month partition");
                stats.skipped += 1;
                continue;
            };
            if year == cutoff.year() && month < cutoff.month() {
                remove_partition(&month_path);
                stats.months_removed += 1;
                continue;
            }
            self.prune_month(&month_path, year, month, cutoff, stats);
            if is_empty_dir(&month_path) {
                remove_empty(&month_path);
                stats.months_removed += 1;
            }
        }
    }

    fn prune_month(
        &self,
        month_path: &Path,
        year: i32,
        month: u32,
        cutoff: NaiveDate,
        stats: &mut PruneStats,
    ) {
        let Ok(days) = fs::read_dir(month_path) else {
            return;
        };
        for day_entry in days.flatten() {
            let day_path = day_entry.path();
            if !day_path.is_dir() {
                continue;
            }
            let day_name = day_entry.file_name().to_string_lossy().into_owned();
            let Some(date) = day_name
                .parse::<u32>()
                .ok()
                .and_then(|day| NaiveDate::from_ymd_opt(year, month, day))
            else {
                warn!(name = %day_name, "skipping non-date day partition");
                stats.skipped += 1;
                continue;
            };
            if date < cutoff {
                remove_partition(&day_path);
                stats.days_removed += 1;
            }
        }
    }
}

fn is_slot_file(name: &str) -> bool {
    name.strip_suffix(".json")
        .map(|stem| stem.len() == 4 && stem.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut reader| reader.next().is_none())
        .unwrap_or(false)
}

fn remove_partition(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partition");
        }
    }
}

fn remove_empty(path: &Path) {
    if let Err(e) = fs::remove_dir(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove empty partition");
        }
    }
}
