//! Hydrological status classification and data staleness checks.

pub mod staleness;
pub mod thresholds;
