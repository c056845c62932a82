//! Deployment configuration.
//!
//! Every constant the pipeline depends on — polling interval, endpoint
//! URLs, table layouts, plausible ranges, the threshold table, retention
//! horizon — lives here as an explicit immutable object injected at
//! construction. Defaults describe the Kotogawa dam + Jiseiji river gauge
//! deployment (10-minute cadence, +09:00); a TOML file overrides them
//! per installation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::{FieldSpec, TableLayout};
use crate::model::{
    FIELD_DAM_LEVEL, FIELD_INFLOW, FIELD_OUTFLOW, FIELD_RAINFALL_CUMULATIVE,
    FIELD_RAINFALL_HOURLY, FIELD_RIVER_LEVEL, FIELD_STORAGE_RATE,
};

/// Environment variable naming an alternative config file path.
pub const CONFIG_PATH_ENV: &str = "KOTOMON_CONFIG";

/// Environment variable overriding the archive root directory.
pub const DATA_DIR_ENV: &str = "KOTOMON_DATA_DIR";

const DEFAULT_CONFIG_PATH: &str = "kotomon.toml";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Archive root. `latest.json` and `history/` live underneath.
    pub data_dir: PathBuf,
    pub polling: PollingConfig,
    pub fetch: FetchConfig,
    pub sources: SourcesConfig,
    pub ranges: RangeConfig,
    pub storage_curve: StorageCurve,
    pub thresholds: ThresholdConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Slot width in minutes. Must divide an hour evenly.
    pub interval_minutes: u32,
    /// Fixed UTC offset of the monitored region, in hours.
    pub utc_offset_hours: i32,
    /// Latest-pointer age beyond which a failed cycle logs a staleness
    /// warning.
    pub max_data_age_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Base backoff; attempt N sleeps `backoff_secs * N` before retrying.
    pub backoff_secs: u64,
    /// Bodies smaller than this are treated as a retryable failure —
    /// the observation pages never legitimately shrink to a stub.
    pub min_body_bytes: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub dam: SourceConfig,
    pub river: SourceConfig,
    /// Optional forecast / precipitation-intensity endpoint, stored
    /// opaquely in the record's `extended` block.
    pub auxiliary_url: Option<String>,
}

/// One station endpoint: URL, station code, and the fixed column layout of
/// its observation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    pub station_code: String,
    pub layout: TableLayout,
}

/// Plausible [min, max] for one bounded field. Values outside are
/// discarded, never clamped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlausibleRange {
    pub min: f64,
    pub max: f64,
}

impl PlausibleRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    pub dam_level: PlausibleRange,
    pub storage_rate: PlausibleRange,
    /// Shared by inflow and outflow.
    pub flow: PlausibleRange,
    pub river_level: PlausibleRange,
    pub rainfall_hourly: PlausibleRange,
    pub rainfall_cumulative: PlausibleRange,
}

impl RangeConfig {
    /// Range for a field key, or `None` for unbounded fields.
    pub fn for_field(&self, field: &str) -> Option<&PlausibleRange> {
        match field {
            FIELD_DAM_LEVEL => Some(&self.dam_level),
            FIELD_STORAGE_RATE => Some(&self.storage_rate),
            FIELD_INFLOW | FIELD_OUTFLOW => Some(&self.flow),
            FIELD_RIVER_LEVEL => Some(&self.river_level),
            FIELD_RAINFALL_HOURLY => Some(&self.rainfall_hourly),
            FIELD_RAINFALL_CUMULATIVE => Some(&self.rainfall_cumulative),
            _ => None,
        }
    }
}

/// Linear reservoir curve used to derive the storage rate from the water
/// level when the rate column itself is missing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageCurve {
    /// Level at 0% storage, in meters.
    pub empty_level: f64,
    /// Level at 100% storage, in meters.
    pub full_level: f64,
}

/// One rung of the river alert ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdStep {
    pub label: String,
    pub min_level: f64,
}

/// River classification ladder plus the two absolute dam alert levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Ascending by `min_level`. Classification takes the highest rung met.
    pub river: Vec<ThresholdStep>,
    /// Label when no rung is met.
    pub normal_label: String,
    /// Label when the level itself is missing.
    pub missing_label: String,
    pub dam_warning: f64,
    pub dam_danger: f64,
}

impl ThresholdConfig {
    /// Whether a raw reading equals one of the ladder constants. The source
    /// pages render the ladder as reference lines in the same markup as
    /// live readings, so an exact match is a reference line, not data.
    pub fn is_reference_value(&self, value: f64) -> bool {
        self.river
            .iter()
            .any(|step| (step.min_level - value).abs() < 1e-6)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub horizon_days: u32,
}

// ---------------------------------------------------------------------------
// Defaults (Kotogawa deployment)
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("data"),
            polling: PollingConfig::default(),
            fetch: FetchConfig::default(),
            sources: SourcesConfig::default(),
            ranges: RangeConfig::default(),
            storage_curve: StorageCurve::default(),
            thresholds: ThresholdConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval_minutes: 10,
            utc_offset_hours: 9,
            max_data_age_minutes: 60,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            timeout_secs: 30,
            max_retries: 3,
            backoff_secs: 5,
            min_body_bytes: 512,
            user_agent: "kotomon_service/0.1".to_string(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        SourcesConfig {
            dam: SourceConfig {
                url: "https://y-bousai.pref.yamaguchi.lg.jp/citizen/dam/kdm_table.aspx"
                    .to_string(),
                station_code: "015".to_string(),
                layout: TableLayout {
                    header_anchor: Some("貯水位".to_string()),
                    date_column: Some(0),
                    time_column: 1,
                    fields: vec![
                        FieldSpec::new(FIELD_DAM_LEVEL, 2, "貯水位"),
                        FieldSpec::new(FIELD_STORAGE_RATE, 3, "貯水率"),
                        FieldSpec::new(FIELD_INFLOW, 4, "流入量"),
                        FieldSpec::new(FIELD_OUTFLOW, 5, "放流量"),
                        FieldSpec::new(FIELD_RAINFALL_HOURLY, 6, "60分雨量"),
                        FieldSpec::new(FIELD_RAINFALL_CUMULATIVE, 7, "累積雨量"),
                    ],
                },
            },
            river: SourceConfig {
                url: "https://y-bousai.pref.yamaguchi.lg.jp/citizen/water/kwl_table.aspx"
                    .to_string(),
                station_code: "05067".to_string(),
                layout: TableLayout {
                    header_anchor: Some("水位".to_string()),
                    date_column: Some(0),
                    time_column: 1,
                    fields: vec![FieldSpec::new(FIELD_RIVER_LEVEL, 2, "水位")],
                },
            },
            auxiliary_url: None,
        }
    }
}

impl Default for RangeConfig {
    fn default() -> Self {
        RangeConfig {
            dam_level: PlausibleRange { min: 30.0, max: 40.0 },
            storage_rate: PlausibleRange { min: 0.0, max: 100.0 },
            flow: PlausibleRange { min: 0.0, max: 1000.0 },
            river_level: PlausibleRange { min: 0.5, max: 10.0 },
            rainfall_hourly: PlausibleRange { min: 0.0, max: 150.0 },
            rainfall_cumulative: PlausibleRange { min: 0.0, max: 1000.0 },
        }
    }
}

impl Default for StorageCurve {
    fn default() -> Self {
        StorageCurve {
            empty_level: 20.0,
            full_level: 40.0,
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig {
            river: vec![
                ThresholdStep {
                    label: "水防団待機".to_string(),
                    min_level: 3.80,
                },
                ThresholdStep {
                    label: "氾濫注意".to_string(),
                    min_level: 5.00,
                },
                ThresholdStep {
                    label: "避難判断".to_string(),
                    min_level: 5.10,
                },
                ThresholdStep {
                    label: "氾濫危険".to_string(),
                    min_level: 5.50,
                },
            ],
            normal_label: "正常".to_string(),
            missing_label: "データなし".to_string(),
            dam_warning: 38.0,
            dam_danger: 39.0,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig { horizon_days: 7 }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Loads configuration from `KOTOMON_CONFIG` (or `kotomon.toml`), falls
    /// back to deployment defaults when the file does not exist, applies
    /// environment overrides, and validates structural invariants.
    pub fn load() -> Result<Config, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            let text = fs::read_to_string(&path)?;
            toml::from_str(&text)?
        } else {
            Config::default()
        };
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a TOML document directly.
    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The monitored region's fixed offset.
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.polling.utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.polling.interval_minutes;
        if interval == 0 || 60 % interval != 0 {
            return Err(ConfigError::Invalid(format!(
                "polling interval {} does not divide an hour",
                interval
            )));
        }
        if self.polling.utc_offset_hours.abs() > 23 {
            return Err(ConfigError::Invalid(format!(
                "UTC offset {} hours is out of range",
                self.polling.utc_offset_hours
            )));
        }
        if self.fetch.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries must be at least 1".to_string(),
            ));
        }
        for (name, range) in [
            ("dam_level", &self.ranges.dam_level),
            ("storage_rate", &self.ranges.storage_rate),
            ("flow", &self.ranges.flow),
            ("river_level", &self.ranges.river_level),
            ("rainfall_hourly", &self.ranges.rainfall_hourly),
            ("rainfall_cumulative", &self.ranges.rainfall_cumulative),
        ] {
            if range.min >= range.max {
                return Err(ConfigError::Invalid(format!(
                    "range {} is inverted: [{}, {}]",
                    name, range.min, range.max
                )));
            }
        }
        if self.storage_curve.empty_level >= self.storage_curve.full_level {
            return Err(ConfigError::Invalid(
                "storage curve empty_level must be below full_level".to_string(),
            ));
        }
        if self.thresholds.river.is_empty() {
            return Err(ConfigError::Invalid(
                "river threshold ladder is empty".to_string(),
            ));
        }
        for pair in self.thresholds.river.windows(2) {
            if pair[0].min_level >= pair[1].min_level {
                return Err(ConfigError::Invalid(format!(
                    "threshold ladder is not ascending: {} ({}) before {} ({})",
                    pair[0].label, pair[0].min_level, pair[1].label, pair[1].min_level
                )));
            }
        }
        if self.thresholds.dam_warning >= self.thresholds.dam_danger {
            return Err(ConfigError::Invalid(
                "dam_warning must be below dam_danger".to_string(),
            ));
        }
        Ok(())
    }
}
