//! Alert-level threshold classification.
//!
//! The river gauge is classified against the ordered threshold ladder:
//! the status is the highest rung whose minimum the validated level
//! meets, checked in descending order. The dam uses two independent
//! absolute levels that only escalate logging — no record field depends
//! on them.

use crate::config::ThresholdConfig;

/// Dam reservoir alert classification, in ascending order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DamAlert {
    Normal,
    Warning,
    Danger,
}

/// Highest ladder rung the level meets; the normal label below the
/// ladder, the missing-data label when the level is null.
pub fn classify_river_level(level: Option<f64>, table: &ThresholdConfig) -> String {
    let Some(level) = level else {
        return table.missing_label.clone();
    };
    for step in table.river.iter().rev() {
        if level >= step.min_level {
            return step.label.clone();
        }
    }
    table.normal_label.clone()
}

pub fn classify_dam_level(level: f64, table: &ThresholdConfig) -> DamAlert {
    if level >= table.dam_danger {
        DamAlert::Danger
    } else if level >= table.dam_warning {
        DamAlert::Warning
    } else {
        DamAlert::Normal
    }
}
