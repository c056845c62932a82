//! Latest-pointer staleness detection.
//!
//! The sources publish every 10 minutes under normal conditions. When a
//! cycle fails outright, the latest pointer is deliberately left at the
//! last known-good record — but a pointer that keeps aging signals a
//! sensor or network outage that will not be obvious downstream. The
//! pipeline warns once the pointer is older than the configured window.
//!
//! # Clock injection
//! `is_stale_at` takes `now` as a parameter rather than reading the
//! clock, so staleness is deterministic in tests.

use chrono::{DateTime, FixedOffset};

/// Returns `true` if `data_time` is older than `max_age_minutes`
/// relative to `now`.
///
/// Staleness is strictly greater than the threshold:
///   age > max_age_minutes  →  stale
///   age == max_age_minutes →  not stale
pub fn is_stale_at(
    data_time: DateTime<FixedOffset>,
    max_age_minutes: i64,
    now: DateTime<FixedOffset>,
) -> bool {
    (now - data_time).num_minutes() > max_age_minutes
}
